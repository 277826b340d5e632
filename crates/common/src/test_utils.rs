//! Test utilities for usb-session
//!
//! Provides a simulated USB bus implementing [`UsbTransport`], with fault
//! injection and resource accounting, so session lifecycles can be tested
//! without hardware.
//!
//! Only built for this crate's own tests or with the `test-utils` feature.

use crate::usb_types::{DescriptorSummary, TransportError, TransportHandle, UsbTransport};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Vendor ID of the simulated target peripheral
pub const TEST_VENDOR_ID: u16 = 0x1733;

/// Product ID of the simulated target peripheral
pub const TEST_PRODUCT_ID: u16 = 0xAABB;

/// Description of one simulated device
#[derive(Debug, Clone)]
pub struct SimDevice {
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    /// Serial string, also used as the lookup key for fault injection
    pub serial: String,
    /// When false the descriptor reports serial index 0
    pub serial_descriptor: bool,
}

impl SimDevice {
    /// A device carrying the target VID/PID
    pub fn matching(serial: &str) -> Self {
        Self {
            vendor_id: TEST_VENDOR_ID,
            product_id: TEST_PRODUCT_ID,
            manufacturer: Some("Test Manufacturer".to_string()),
            product: Some("Test Product".to_string()),
            serial: serial.to_string(),
            serial_descriptor: true,
        }
    }

    /// A device with some other VID/PID
    pub fn foreign(vendor_id: u16, product_id: u16, serial: &str) -> Self {
        Self {
            vendor_id,
            product_id,
            ..Self::matching(serial)
        }
    }

    /// Drop the manufacturer and product strings (indices become 0)
    pub fn without_names(mut self) -> Self {
        self.manufacturer = None;
        self.product = None;
        self
    }

    /// Report serial index 0
    pub fn without_serial_descriptor(mut self) -> Self {
        self.serial_descriptor = false;
        self
    }
}

/// Observable transport activity, in the order it happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    Opened { serial: String },
    Configured { serial: String, configuration: u8 },
    Claimed { serial: String, interface: u8 },
    Released { serial: String, interface: u8 },
    BulkOut { serial: String, endpoint: u8, data: Vec<u8> },
    Closed { serial: String },
}

#[derive(Debug, Default)]
struct Faults {
    descriptor: Option<TransportError>,
    open: Option<TransportError>,
    strings: Option<TransportError>,
    configuration: Option<TransportError>,
    claim: Option<TransportError>,
    release: Option<TransportError>,
    bulk_out: Option<TransportError>,
}

#[derive(Debug)]
struct DeviceState {
    spec: SimDevice,
    inbound: VecDeque<Vec<u8>>,
    read_errors: VecDeque<TransportError>,
    faults: Faults,
    removed: bool,
}

#[derive(Debug, Default)]
struct BusState {
    devices: Mutex<Vec<DeviceState>>,
    enumerate_fault: Mutex<Option<TransportError>>,
    events: Mutex<Vec<BusEvent>>,
    live_device_refs: AtomicUsize,
    open_handles: AtomicUsize,
    claimed_interfaces: AtomicUsize,
    reads_in_flight: AtomicUsize,
    reads_started: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BusState {
    fn record(&self, event: BusEvent) {
        lock(&self.events).push(event);
    }

    fn with_device<R>(&self, index: usize, f: impl FnOnce(&mut DeviceState) -> R) -> R {
        let mut devices = lock(&self.devices);
        f(&mut devices[index])
    }
}

/// A simulated USB bus
///
/// Cloning shares the same bus, so a test can hand one clone to the code
/// under test and inspect the other.
#[derive(Debug, Clone, Default)]
pub struct SimulatedBus {
    state: Arc<BusState>,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a device to the bus (bus order is insertion order)
    pub fn add_device(&self, device: SimDevice) {
        lock(&self.state.devices).push(DeviceState {
            spec: device,
            inbound: VecDeque::new(),
            read_errors: VecDeque::new(),
            faults: Faults::default(),
            removed: false,
        });
    }

    /// Simulate unplugging: the device disappears from enumeration and open
    /// handles report `NoDevice`
    pub fn unplug(&self, serial: &str) {
        self.configure(serial, |d| d.removed = true);
    }

    /// Queue one inbound packet for the device
    pub fn push_inbound(&self, serial: &str, data: &[u8]) {
        self.configure(serial, |d| d.inbound.push_back(data.to_vec()));
    }

    /// Queue a one-shot inbound transfer failure for the device
    pub fn push_read_error(&self, serial: &str, err: TransportError) {
        self.configure(serial, |d| d.read_errors.push_back(err));
    }

    pub fn fail_enumerate(&self, err: TransportError) {
        *lock(&self.state.enumerate_fault) = Some(err);
    }

    pub fn fail_descriptor(&self, serial: &str, err: TransportError) {
        self.configure(serial, |d| d.faults.descriptor = Some(err));
    }

    pub fn fail_open(&self, serial: &str, err: TransportError) {
        self.configure(serial, |d| d.faults.open = Some(err));
    }

    pub fn fail_strings(&self, serial: &str, err: TransportError) {
        self.configure(serial, |d| d.faults.strings = Some(err));
    }

    pub fn fail_configuration(&self, serial: &str, err: TransportError) {
        self.configure(serial, |d| d.faults.configuration = Some(err));
    }

    pub fn fail_claim(&self, serial: &str, err: TransportError) {
        self.configure(serial, |d| d.faults.claim = Some(err));
    }

    pub fn fail_release(&self, serial: &str, err: TransportError) {
        self.configure(serial, |d| d.faults.release = Some(err));
    }

    pub fn fail_bulk_out(&self, serial: &str, err: TransportError) {
        self.configure(serial, |d| d.faults.bulk_out = Some(err));
    }

    /// Device references handed out by `devices()` and not yet dropped
    pub fn live_device_refs(&self) -> usize {
        self.state.live_device_refs.load(Ordering::SeqCst)
    }

    pub fn open_handles(&self) -> usize {
        self.state.open_handles.load(Ordering::SeqCst)
    }

    /// Interfaces claimed and not explicitly released
    pub fn claimed_interfaces(&self) -> usize {
        self.state.claimed_interfaces.load(Ordering::SeqCst)
    }

    /// Inbound transfers currently blocked inside the transport
    pub fn reads_in_flight(&self) -> usize {
        self.state.reads_in_flight.load(Ordering::SeqCst)
    }

    /// Inbound transfers issued since the bus was created
    pub fn reads_started(&self) -> usize {
        self.state.reads_started.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<BusEvent> {
        lock(&self.state.events).clone()
    }

    /// Activate/deactivate payloads written to the device, in order
    pub fn bulk_out_payloads(&self, serial: &str) -> Vec<Vec<u8>> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                BusEvent::BulkOut { serial: s, data, .. } if s == serial => Some(data),
                _ => None,
            })
            .collect()
    }

    fn configure(&self, serial: &str, f: impl FnOnce(&mut DeviceState)) {
        let mut devices = lock(&self.state.devices);
        if let Some(device) = devices.iter_mut().find(|d| d.spec.serial == serial) {
            f(device);
        }
    }
}

/// Enumerated reference into the simulated bus
#[derive(Debug)]
pub struct SimDeviceRef {
    state: Arc<BusState>,
    index: usize,
}

impl Drop for SimDeviceRef {
    fn drop(&mut self) {
        self.state.live_device_refs.fetch_sub(1, Ordering::SeqCst);
    }
}

// String descriptor indices used by the simulated descriptors
const MANUFACTURER_INDEX: u8 = 1;
const PRODUCT_INDEX: u8 = 2;
const SERIAL_INDEX: u8 = 3;

impl UsbTransport for SimulatedBus {
    type Device = SimDeviceRef;
    type Handle = SimHandle;

    fn devices(&self) -> Result<Vec<SimDeviceRef>, TransportError> {
        if let Some(err) = *lock(&self.state.enumerate_fault) {
            return Err(err);
        }

        let devices = lock(&self.state.devices);
        let refs = devices
            .iter()
            .enumerate()
            .filter(|(_, d)| !d.removed)
            .map(|(index, _)| {
                self.state.live_device_refs.fetch_add(1, Ordering::SeqCst);
                SimDeviceRef {
                    state: Arc::clone(&self.state),
                    index,
                }
            })
            .collect();
        Ok(refs)
    }

    fn descriptor(&self, device: &SimDeviceRef) -> Result<DescriptorSummary, TransportError> {
        self.state.with_device(device.index, |d| {
            if let Some(err) = d.faults.descriptor {
                return Err(err);
            }
            Ok(DescriptorSummary {
                vendor_id: d.spec.vendor_id,
                product_id: d.spec.product_id,
                manufacturer_index: d.spec.manufacturer.as_ref().map_or(0, |_| MANUFACTURER_INDEX),
                product_index: d.spec.product.as_ref().map_or(0, |_| PRODUCT_INDEX),
                serial_index: if d.spec.serial_descriptor {
                    SERIAL_INDEX
                } else {
                    0
                },
            })
        })
    }

    fn open(&self, device: &SimDeviceRef) -> Result<SimHandle, TransportError> {
        let serial = self.state.with_device(device.index, |d| {
            if d.removed {
                return Err(TransportError::NoDevice);
            }
            match d.faults.open {
                Some(err) => Err(err),
                None => Ok(d.spec.serial.clone()),
            }
        })?;

        self.state.open_handles.fetch_add(1, Ordering::SeqCst);
        self.state.record(BusEvent::Opened {
            serial: serial.clone(),
        });

        Ok(SimHandle {
            state: Arc::clone(&self.state),
            index: device.index,
            serial,
        })
    }
}

/// Open handle on the simulated bus; dropping it closes the handle
#[derive(Debug)]
pub struct SimHandle {
    state: Arc<BusState>,
    index: usize,
    serial: String,
}

impl SimHandle {
    fn read_packet(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        self.state.reads_started.fetch_add(1, Ordering::SeqCst);
        self.state.reads_in_flight.fetch_add(1, Ordering::SeqCst);

        let immediate = self.state.with_device(self.index, |d| {
            if d.removed {
                return Some(Err(TransportError::NoDevice));
            }
            if let Some(err) = d.read_errors.pop_front() {
                return Some(Err(err));
            }
            d.inbound.pop_front().map(|packet| {
                let len = packet.len().min(buf.len());
                buf[..len].copy_from_slice(&packet[..len]);
                Ok(len)
            })
        });

        let result = match immediate {
            Some(result) => result,
            None => {
                std::thread::sleep(timeout);
                Err(TransportError::Timeout)
            }
        };

        self.state.reads_in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn check_present(&self) -> Result<(), TransportError> {
        if self.state.with_device(self.index, |d| d.removed) {
            Err(TransportError::NoDevice)
        } else {
            Ok(())
        }
    }
}

impl TransportHandle for SimHandle {
    fn set_configuration(&mut self, configuration: u8) -> Result<(), TransportError> {
        self.check_present()?;
        if let Some(err) = self.state.with_device(self.index, |d| d.faults.configuration) {
            return Err(err);
        }
        self.state.record(BusEvent::Configured {
            serial: self.serial.clone(),
            configuration,
        });
        Ok(())
    }

    fn claim_interface(&mut self, interface: u8) -> Result<(), TransportError> {
        self.check_present()?;
        if let Some(err) = self.state.with_device(self.index, |d| d.faults.claim) {
            return Err(err);
        }
        self.state.claimed_interfaces.fetch_add(1, Ordering::SeqCst);
        self.state.record(BusEvent::Claimed {
            serial: self.serial.clone(),
            interface,
        });
        Ok(())
    }

    fn release_interface(&mut self, interface: u8) -> Result<(), TransportError> {
        if let Some(err) = self.state.with_device(self.index, |d| d.faults.release) {
            return Err(err);
        }
        self.state.claimed_interfaces.fetch_sub(1, Ordering::SeqCst);
        self.state.record(BusEvent::Released {
            serial: self.serial.clone(),
            interface,
        });
        Ok(())
    }

    fn read_string_descriptor(&self, index: u8) -> Result<String, TransportError> {
        self.state.with_device(self.index, |d| {
            if let Some(err) = d.faults.strings {
                return Err(err);
            }
            let text = match index {
                MANUFACTURER_INDEX => d.spec.manufacturer.clone(),
                PRODUCT_INDEX => d.spec.product.clone(),
                SERIAL_INDEX => Some(d.spec.serial.clone()),
                _ => None,
            };
            text.ok_or(TransportError::InvalidParam)
        })
    }

    fn read_bulk(
        &self,
        _endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.read_packet(buf, timeout)
    }

    fn write_bulk(
        &self,
        endpoint: u8,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.check_present()?;
        if let Some(err) = self.state.with_device(self.index, |d| d.faults.bulk_out) {
            return Err(err);
        }
        self.state.record(BusEvent::BulkOut {
            serial: self.serial.clone(),
            endpoint,
            data: data.to_vec(),
        });
        Ok(data.len())
    }

    fn read_interrupt(
        &self,
        _endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.read_packet(buf, timeout)
    }
}

impl Drop for SimHandle {
    fn drop(&mut self) {
        self.state.open_handles.fetch_sub(1, Ordering::SeqCst);
        self.state.record(BusEvent::Closed {
            serial: self.serial.clone(),
        });
    }
}

/// Poll `condition` until it holds or `timeout` elapses
///
/// Returns whether the condition was observed.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}
