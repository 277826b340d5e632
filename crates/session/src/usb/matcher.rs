//! Device matching
//!
//! Scans the transport's device list for the configured VID/PID pair and
//! resolves each match to a [`DeviceIdentity`], or locates one device by its
//! serial string. Devices that fail a descriptor read, an open or a string
//! read are skipped; they never abort the scan. The enumeration list is
//! dropped on every return path.

use common::{
    DescriptorSummary, DeviceIdentity, Error, Result, TransportError, TransportHandle,
    UsbTransport, bounded_text,
};
use tracing::{debug, trace, warn};

/// Filters a transport's devices by VID/PID
pub struct DeviceMatcher<'a, T: UsbTransport> {
    transport: &'a T,
    vendor_id: u16,
    product_id: u16,
}

impl<'a, T: UsbTransport> DeviceMatcher<'a, T> {
    pub fn new(transport: &'a T, vendor_id: u16, product_id: u16) -> Self {
        Self {
            transport,
            vendor_id,
            product_id,
        }
    }

    /// Resolve the identity of up to `max_results` matching devices, in bus order
    ///
    /// An empty result is not an error here.
    pub fn scan(&self, max_results: usize) -> Result<Vec<DeviceIdentity>> {
        if max_results == 0 {
            return Err(Error::InvalidParameter(
                "max_results must be greater than 0".to_string(),
            ));
        }

        let devices = self
            .transport
            .devices()
            .map_err(|e| Error::transport("enumerate devices", e))?;
        debug!("Found {} USB devices", devices.len());

        let mut found = Vec::new();
        for device in &devices {
            if found.len() >= max_results {
                break;
            }

            let Some(desc) = self.matching_descriptor(device) else {
                continue;
            };

            let handle = match self.transport.open(device) {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(
                        "Cannot open device {:04x}:{:04x}: {}",
                        desc.vendor_id,
                        desc.product_id,
                        e.name()
                    );
                    continue;
                }
            };

            // The scan handle is closed at the end of this iteration
            match read_identity(&handle, &desc) {
                Ok(identity) => {
                    debug!(
                        "Device {}: serial={}, manufacturer={}, product={}",
                        found.len() + 1,
                        identity.serial,
                        identity.manufacturer,
                        identity.product
                    );
                    found.push(identity);
                }
                Err(e) => {
                    warn!(
                        "Skipping device {:04x}:{:04x}, string descriptors unreadable: {}",
                        desc.vendor_id,
                        desc.product_id,
                        e.name()
                    );
                }
            }
        }

        debug!("Found {} matching device(s)", found.len());
        Ok(found)
    }

    /// Open the matching device whose serial string equals `serial`
    ///
    /// The returned handle is still open. Handles opened for non-matching
    /// devices are closed before moving on.
    pub fn find(&self, serial: &str) -> Result<(T::Handle, String)> {
        self.find_where(|candidate| candidate == serial)?
            .ok_or_else(|| Error::NotFound(format!("no device with serial {}", serial)))
    }

    /// Open the first matching device with a readable, non-empty serial
    /// that `accept` agrees to
    pub fn find_first(&self, accept: impl Fn(&str) -> bool) -> Result<(T::Handle, String)> {
        self.find_where(|candidate| !candidate.is_empty() && accept(candidate))?
            .ok_or_else(|| Error::NotFound("no matching device available".to_string()))
    }

    fn find_where(&self, accept: impl Fn(&str) -> bool) -> Result<Option<(T::Handle, String)>> {
        let devices = self
            .transport
            .devices()
            .map_err(|e| Error::transport("enumerate devices", e))?;

        for device in &devices {
            let Some(desc) = self.matching_descriptor(device) else {
                continue;
            };

            let handle = match self.transport.open(device) {
                Ok(handle) => handle,
                Err(e) => {
                    debug!("Cannot open candidate device: {}", e.name());
                    continue;
                }
            };

            let serial = match read_string(&handle, desc.serial_index) {
                Ok(serial) => bounded_text(&serial),
                Err(e) => {
                    debug!("Cannot read serial of candidate device: {}", e.name());
                    continue;
                }
            };

            if accept(&serial) {
                debug!("Found target device with S/N: {}", serial);
                return Ok(Some((handle, serial)));
            }

            trace!("Skipping device with S/N: {}", serial);
        }

        Ok(None)
    }

    fn matching_descriptor(&self, device: &T::Device) -> Option<DescriptorSummary> {
        match self.transport.descriptor(device) {
            Ok(desc) if desc.matches(self.vendor_id, self.product_id) => Some(desc),
            Ok(_) => None,
            Err(e) => {
                warn!("Failed to get device descriptor: {}", e.name());
                None
            }
        }
    }
}

/// Read a string descriptor, treating index 0 as the empty string
pub fn read_string<H: TransportHandle>(
    handle: &H,
    index: u8,
) -> std::result::Result<String, TransportError> {
    if index == 0 {
        return Ok(String::new());
    }
    handle.read_string_descriptor(index)
}

fn read_identity<H: TransportHandle>(
    handle: &H,
    desc: &DescriptorSummary,
) -> std::result::Result<DeviceIdentity, TransportError> {
    let manufacturer = read_string(handle, desc.manufacturer_index)?;
    let product = read_string(handle, desc.product_index)?;
    let serial = read_string(handle, desc.serial_index)?;

    Ok(DeviceIdentity::new(&serial, &manufacturer, &product))
}
