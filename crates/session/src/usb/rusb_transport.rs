//! libusb-backed transport
//!
//! Thin adapter from `rusb` onto the [`UsbTransport`]/[`TransportHandle`]
//! traits. Dropping a [`RusbHandle`] closes the libusb handle; dropping the
//! [`RusbTransport`] releases the libusb context once the last device
//! reference is gone.

use common::{DescriptorSummary, TransportError, TransportHandle, UsbTransport};
use rusb::{Context, Device, DeviceHandle, UsbContext};
use std::time::Duration;
use tracing::{debug, warn};

/// Process-wide libusb context
pub struct RusbTransport {
    context: Context,
}

impl RusbTransport {
    /// Create a new libusb context
    pub fn new() -> Result<Self, TransportError> {
        let context = Context::new().map_err(map_rusb_error)?;
        debug!("libusb context initialized");
        Ok(Self { context })
    }

    /// Get USB context
    pub fn context(&self) -> &Context {
        &self.context
    }
}

impl UsbTransport for RusbTransport {
    type Device = Device<Context>;
    type Handle = RusbHandle;

    fn devices(&self) -> Result<Vec<Device<Context>>, TransportError> {
        let list = self.context.devices().map_err(map_rusb_error)?;
        Ok(list.iter().collect())
    }

    fn descriptor(&self, device: &Device<Context>) -> Result<DescriptorSummary, TransportError> {
        let desc = device.device_descriptor().map_err(map_rusb_error)?;

        Ok(DescriptorSummary {
            vendor_id: desc.vendor_id(),
            product_id: desc.product_id(),
            manufacturer_index: desc.manufacturer_string_index().unwrap_or(0),
            product_index: desc.product_string_index().unwrap_or(0),
            serial_index: desc.serial_number_string_index().unwrap_or(0),
        })
    }

    fn open(&self, device: &Device<Context>) -> Result<RusbHandle, TransportError> {
        let handle = device.open().map_err(|e| {
            warn!(
                "Failed to open device bus={}, addr={}: {}",
                device.bus_number(),
                device.address(),
                e
            );
            map_rusb_error(e)
        })?;

        debug!(
            "Opened device bus={}, addr={}",
            device.bus_number(),
            device.address()
        );

        Ok(RusbHandle {
            handle,
            detached_interfaces: Vec::new(),
        })
    }
}

/// Open libusb device handle
pub struct RusbHandle {
    handle: DeviceHandle<Context>,
    /// Interfaces whose kernel driver we detached before claiming
    detached_interfaces: Vec<u8>,
}

impl TransportHandle for RusbHandle {
    fn set_configuration(&mut self, configuration: u8) -> Result<(), TransportError> {
        self.handle
            .set_active_configuration(configuration)
            .map_err(map_rusb_error)
    }

    fn claim_interface(&mut self, interface: u8) -> Result<(), TransportError> {
        // Detach kernel driver if active
        match self.handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!("Detaching kernel driver from interface {}", interface);
                match self.handle.detach_kernel_driver(interface) {
                    Ok(()) => self.detached_interfaces.push(interface),
                    Err(e) => warn!(
                        "Failed to detach kernel driver from interface {}: {}",
                        interface, e
                    ),
                }
            }
            Ok(false) => {}
            Err(e) => {
                debug!(
                    "Could not check kernel driver status for interface {}: {}",
                    interface, e
                );
            }
        }

        self.handle
            .claim_interface(interface)
            .map_err(map_rusb_error)
    }

    fn release_interface(&mut self, interface: u8) -> Result<(), TransportError> {
        let result = self
            .handle
            .release_interface(interface)
            .map_err(map_rusb_error);

        // Hand the interface back to the kernel driver we took it from
        if let Some(pos) = self.detached_interfaces.iter().position(|&i| i == interface) {
            self.detached_interfaces.remove(pos);
            if let Err(e) = self.handle.attach_kernel_driver(interface) {
                debug!(
                    "Could not reattach kernel driver to interface {}: {}",
                    interface, e
                );
            }
        }

        result
    }

    fn read_string_descriptor(&self, index: u8) -> Result<String, TransportError> {
        self.handle
            .read_string_descriptor_ascii(index)
            .map_err(map_rusb_error)
    }

    fn read_bulk(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.handle
            .read_bulk(endpoint, buf, timeout)
            .map_err(map_rusb_error)
    }

    fn write_bulk(
        &self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.handle
            .write_bulk(endpoint, data, timeout)
            .map_err(map_rusb_error)
    }

    fn read_interrupt(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.handle
            .read_interrupt(endpoint, buf, timeout)
            .map_err(map_rusb_error)
    }
}

/// Map rusb::Error to the libusb-coded TransportError
pub fn map_rusb_error(err: rusb::Error) -> TransportError {
    match err {
        rusb::Error::Io => TransportError::Io,
        rusb::Error::InvalidParam => TransportError::InvalidParam,
        rusb::Error::Access => TransportError::Access,
        rusb::Error::NoDevice => TransportError::NoDevice,
        rusb::Error::NotFound => TransportError::NotFound,
        rusb::Error::Busy => TransportError::Busy,
        rusb::Error::Timeout => TransportError::Timeout,
        rusb::Error::Overflow => TransportError::Overflow,
        rusb::Error::Pipe => TransportError::Pipe,
        rusb::Error::Interrupted => TransportError::Interrupted,
        rusb::Error::NoMem => TransportError::NoMem,
        rusb::Error::NotSupported => TransportError::NotSupported,
        _ => TransportError::Other,
    }
}
