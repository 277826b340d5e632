//! Common utilities for usb-session
//!
//! This crate provides the pieces shared by the session manager and its
//! tests: the error taxonomy, logging setup, the USB transport abstraction
//! and a simulated bus for hardware-free testing.

pub mod error;
pub mod logging;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod usb_types;

pub use error::{Error, Result};
pub use logging::setup_logging;
pub use usb_types::{
    DescriptorSummary, DeviceIdentity, MAX_STRING_LENGTH, TransportError, TransportHandle,
    UsbTransport, bounded_text,
};
