//! USB type abstractions and utilities
//!
//! The session manager never talks to a USB stack directly. It goes through
//! [`UsbTransport`] and [`TransportHandle`], which cover exactly the blocking
//! primitives it needs: enumerate, read a device descriptor, open, set the
//! configuration, claim/release an interface, bulk and interrupt transfers and
//! string descriptors. Closing a handle is dropping it.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Capacity of a text field in a [`DeviceIdentity`], including the
/// terminator slot of the fixed-size field it replaces
pub const MAX_STRING_LENGTH: usize = 256;

/// Transport-level failure with a libusb-compatible numeric code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum TransportError {
    #[error("input/output error")]
    Io,
    #[error("invalid parameter")]
    InvalidParam,
    #[error("access denied")]
    Access,
    #[error("no such device")]
    NoDevice,
    #[error("entity not found")]
    NotFound,
    #[error("resource busy")]
    Busy,
    #[error("operation timed out")]
    Timeout,
    #[error("overflow")]
    Overflow,
    #[error("pipe error")]
    Pipe,
    #[error("system call interrupted")]
    Interrupted,
    #[error("insufficient memory")]
    NoMem,
    #[error("operation not supported")]
    NotSupported,
    #[error("other error")]
    Other,
}

impl TransportError {
    /// Signed result code as reported by libusb
    pub fn code(self) -> i32 {
        match self {
            TransportError::Io => -1,
            TransportError::InvalidParam => -2,
            TransportError::Access => -3,
            TransportError::NoDevice => -4,
            TransportError::NotFound => -5,
            TransportError::Busy => -6,
            TransportError::Timeout => -7,
            TransportError::Overflow => -8,
            TransportError::Pipe => -9,
            TransportError::Interrupted => -10,
            TransportError::NoMem => -11,
            TransportError::NotSupported => -12,
            TransportError::Other => -99,
        }
    }

    /// Map a libusb result code back to an error
    ///
    /// Non-negative codes are successes and yield `None`. Unknown negative
    /// codes collapse to [`TransportError::Other`].
    pub fn from_code(code: i32) -> Option<Self> {
        let err = match code {
            c if c >= 0 => return None,
            -1 => TransportError::Io,
            -2 => TransportError::InvalidParam,
            -3 => TransportError::Access,
            -4 => TransportError::NoDevice,
            -5 => TransportError::NotFound,
            -6 => TransportError::Busy,
            -7 => TransportError::Timeout,
            -8 => TransportError::Overflow,
            -9 => TransportError::Pipe,
            -10 => TransportError::Interrupted,
            -11 => TransportError::NoMem,
            -12 => TransportError::NotSupported,
            _ => TransportError::Other,
        };
        Some(err)
    }

    /// libusb symbolic name, handy in log lines
    pub fn name(self) -> &'static str {
        match self {
            TransportError::Io => "LIBUSB_ERROR_IO",
            TransportError::InvalidParam => "LIBUSB_ERROR_INVALID_PARAM",
            TransportError::Access => "LIBUSB_ERROR_ACCESS",
            TransportError::NoDevice => "LIBUSB_ERROR_NO_DEVICE",
            TransportError::NotFound => "LIBUSB_ERROR_NOT_FOUND",
            TransportError::Busy => "LIBUSB_ERROR_BUSY",
            TransportError::Timeout => "LIBUSB_ERROR_TIMEOUT",
            TransportError::Overflow => "LIBUSB_ERROR_OVERFLOW",
            TransportError::Pipe => "LIBUSB_ERROR_PIPE",
            TransportError::Interrupted => "LIBUSB_ERROR_INTERRUPTED",
            TransportError::NoMem => "LIBUSB_ERROR_NO_MEM",
            TransportError::NotSupported => "LIBUSB_ERROR_NOT_SUPPORTED",
            TransportError::Other => "LIBUSB_ERROR_OTHER",
        }
    }
}

/// The part of a device descriptor the session manager cares about
///
/// String indices of 0 mean "no such string".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DescriptorSummary {
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer_index: u8,
    pub product_index: u8,
    pub serial_index: u8,
}

impl DescriptorSummary {
    /// Check whether this descriptor carries the given VID/PID pair
    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id == vendor_id && self.product_id == product_id
    }
}

/// Enumeration side of a USB stack
///
/// Device references returned by [`UsbTransport::devices`] are released when
/// dropped, so every exit path of a scan frees the enumeration list.
pub trait UsbTransport: Send + Sync + 'static {
    /// A reference to one enumerated device
    type Device: Send;
    /// An open, exclusive device handle
    type Handle: TransportHandle;

    /// Enumerate every device currently visible to the stack, in bus order
    fn devices(&self) -> Result<Vec<Self::Device>, TransportError>;

    /// Read the device descriptor of an enumerated device
    fn descriptor(&self, device: &Self::Device) -> Result<DescriptorSummary, TransportError>;

    /// Open a handle to an enumerated device
    fn open(&self, device: &Self::Device) -> Result<Self::Handle, TransportError>;
}

/// Operations on an open device handle
///
/// Transfers take `&self` so a reader thread can poll while the owner keeps
/// the handle; configuration and interface claims need exclusive access.
pub trait TransportHandle: Send + Sync + 'static {
    fn set_configuration(&mut self, configuration: u8) -> Result<(), TransportError>;

    fn claim_interface(&mut self, interface: u8) -> Result<(), TransportError>;

    fn release_interface(&mut self, interface: u8) -> Result<(), TransportError>;

    /// Read an ASCII string descriptor. Index 0 is never passed.
    fn read_string_descriptor(&self, index: u8) -> Result<String, TransportError>;

    fn read_bulk(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    fn write_bulk(
        &self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    fn read_interrupt(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;
}

/// Resolved identity of one matching device, as of one scan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub serial: String,
    pub manufacturer: String,
    pub product: String,
}

impl DeviceIdentity {
    /// Build an identity, truncating every field to its fixed capacity
    pub fn new(serial: &str, manufacturer: &str, product: &str) -> Self {
        Self {
            serial: bounded_text(serial),
            manufacturer: bounded_text(manufacturer),
            product: bounded_text(product),
        }
    }

    /// Serial equality is the only identity that matters for matching
    pub fn matches_serial(&self, serial: &str) -> bool {
        self.serial == serial
    }
}

/// Truncate text to fit a `MAX_STRING_LENGTH` field (one slot is reserved
/// for the terminator), never splitting a UTF-8 character
pub fn bounded_text(text: &str) -> String {
    let limit = MAX_STRING_LENGTH - 1;
    if text.len() <= limit {
        return text.to_string();
    }

    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_round_trip() {
        for err in [
            TransportError::Io,
            TransportError::NoDevice,
            TransportError::Timeout,
            TransportError::NotSupported,
            TransportError::Other,
        ] {
            assert_eq!(TransportError::from_code(err.code()), Some(err));
        }
    }

    #[test]
    fn test_from_code_edges() {
        assert_eq!(TransportError::from_code(0), None);
        assert_eq!(TransportError::from_code(12), None);
        assert_eq!(TransportError::from_code(-42), Some(TransportError::Other));
        assert_eq!(TransportError::Timeout.name(), "LIBUSB_ERROR_TIMEOUT");
    }

    #[test]
    fn test_descriptor_matches() {
        let desc = DescriptorSummary {
            vendor_id: 0x1733,
            product_id: 0xAABB,
            ..Default::default()
        };
        assert!(desc.matches(0x1733, 0xAABB));
        assert!(!desc.matches(0x1733, 0xAABC));
        assert!(!desc.matches(0x1734, 0xAABB));
    }

    #[test]
    fn test_bounded_text_truncates() {
        let long = "x".repeat(400);
        assert_eq!(bounded_text(&long).len(), MAX_STRING_LENGTH - 1);
        assert_eq!(bounded_text("A1"), "A1");
    }

    #[test]
    fn test_bounded_text_respects_char_boundary() {
        // 254 ASCII bytes followed by a 3-byte character straddling the limit
        let text = format!("{}{}", "a".repeat(254), "€");
        let bounded = bounded_text(&text);
        assert_eq!(bounded.len(), 254);
        assert!(bounded.chars().all(|c| c == 'a'));
    }

    #[test]
    fn test_identity_serializes() {
        let identity = DeviceIdentity::new("345E34593133", "Acme", "Sensor");
        let json = serde_json::to_string(&identity).unwrap();
        assert!(json.contains("345E34593133"));
        let parsed: DeviceIdentity = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, identity);
        assert!(parsed.matches_serial("345E34593133"));
    }
}
