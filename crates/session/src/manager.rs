//! Session manager
//!
//! Entry point for host code: scans for the target peripheral, opens and
//! closes sessions by serial number and hands out buffered inbound data.
//! All operations except [`exit`](SessionManager::exit) take `&self` and may
//! be called from several threads at once.

use crate::config::SessionConfig;
use crate::usb::{DeviceMatcher, RusbTransport, Session, SessionStats, SessionTable, SlotState};
use bytes::Bytes;
use common::{DeviceIdentity, Error, MAX_STRING_LENGTH, Result, UsbTransport};
use tracing::{debug, info, warn};

pub struct SessionManager<T: UsbTransport = RusbTransport> {
    /// `None` once the manager has exited
    transport: Option<T>,
    table: SessionTable<T::Handle>,
    config: SessionConfig,
}

impl SessionManager<RusbTransport> {
    /// Create a manager backed by a fresh libusb context
    pub fn init(config: SessionConfig) -> Result<Self> {
        check_config(&config)?;
        let transport =
            RusbTransport::new().map_err(|e| Error::transport("initialize libusb", e))?;
        Self::with_transport(transport, config)
    }
}

impl<T: UsbTransport> SessionManager<T> {
    /// Create a manager over an existing transport
    pub fn with_transport(transport: T, config: SessionConfig) -> Result<Self> {
        check_config(&config)?;

        info!(
            "Session manager ready for {:04x}:{:04x}",
            config.device.vendor_id, config.device.product_id
        );

        Ok(Self {
            transport: Some(transport),
            table: SessionTable::new(config.session.max_sessions),
            config,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.transport.is_some()
    }

    fn matcher(&self) -> Result<DeviceMatcher<'_, T>> {
        let transport = self.transport.as_ref().ok_or(Error::NotInitialized)?;
        Ok(DeviceMatcher::new(
            transport,
            self.config.device.vendor_id,
            self.config.device.product_id,
        ))
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.transport.is_some() {
            Ok(())
        } else {
            Err(Error::NotInitialized)
        }
    }

    /// List up to `max_results` attached target devices in bus order
    ///
    /// Finding none is not an error; the result is simply empty.
    pub fn scan(&self, max_results: u32) -> Result<Vec<DeviceIdentity>> {
        let found = self.matcher()?.scan(max_results as usize)?;
        if found.is_empty() {
            info!("No matching devices found");
        }
        Ok(found)
    }

    /// Open the device with this serial number
    pub fn open(&self, serial: &str) -> Result<()> {
        validate_serial(serial)?;
        let matcher = self.matcher()?;

        let reservation = self.table.reserve(serial)?;
        info!("Opening device {}", serial);

        let (handle, serial) = matcher.find(serial)?;
        let session = self.activate(handle, serial)?;
        reservation.commit(session);
        Ok(())
    }

    /// Open the first attached device that has no session yet
    ///
    /// Returns the serial number it was opened under.
    pub fn open_first(&self) -> Result<String> {
        let matcher = self.matcher()?;

        let (handle, serial) = matcher.find_first(|candidate| !self.table.contains(candidate))?;
        let reservation = self.table.reserve(&serial)?;
        info!("Opening first available device {}", serial);

        let session = self.activate(handle, serial.clone())?;
        reservation.commit(session);
        Ok(serial)
    }

    fn activate(&self, handle: T::Handle, serial: String) -> Result<Session<T::Handle>> {
        let session = Session::establish(handle, serial, &self.config)?;

        if self.config.session.auto_start_reader {
            if let Err(e) = session.start_reader(&self.config) {
                warn!("Failed to start reader for {}: {}", session.serial(), e);
                session.close(&self.config);
                return Err(e);
            }
        }

        Ok(session)
    }

    /// Close the session for this serial number
    ///
    /// Blocks until the reader thread has exited.
    pub fn close(&self, serial: &str) -> Result<()> {
        validate_serial(serial)?;
        self.ensure_initialized()?;

        let session = self.table.begin_close(serial)?;
        info!("Closing device {}", serial);
        session.close(&self.config);
        self.table.finish_close(serial);
        Ok(())
    }

    /// Take up to `max_len` buffered bytes; never blocks
    pub fn read(&self, serial: &str, max_len: u32) -> Result<Bytes> {
        validate_serial(serial)?;
        self.ensure_initialized()?;
        if max_len == 0 {
            return Err(Error::InvalidParameter(
                "max_len must be greater than 0".to_string(),
            ));
        }

        let data = self
            .table
            .with_session(serial, |session| session.read(max_len as usize))?;
        debug!("Read {} bytes from {}", data.len(), serial);
        Ok(data)
    }

    /// Start the background reader; `Busy` while one runs or is stopping
    pub fn start_reader(&self, serial: &str) -> Result<()> {
        validate_serial(serial)?;
        self.ensure_initialized()?;
        self.table
            .with_session(serial, |session| session.start_reader(&self.config))?
    }

    /// Stop the background reader; a no-op when it is not running
    ///
    /// Blocks until the thread has exited. The join runs outside the table
    /// lock, while the session's reader slot stays locked.
    pub fn stop_reader(&self, serial: &str) -> Result<()> {
        validate_serial(serial)?;
        self.ensure_initialized()?;
        let slot = self.table.with_session(serial, Session::reader_slot)?;
        slot.stop();
        Ok(())
    }

    pub fn is_open(&self, serial: &str) -> bool {
        self.table.state(serial) == Some(SlotState::Open)
    }

    pub fn open_serials(&self) -> Vec<String> {
        self.table.open_serials()
    }

    pub fn stats(&self, serial: &str) -> Result<SessionStats> {
        validate_serial(serial)?;
        self.table.stats(serial)
    }

    /// Close every session, then release the transport
    ///
    /// Safe to call more than once; later operations fail with
    /// `NotInitialized`.
    pub fn exit(&mut self) {
        let Some(transport) = self.transport.take() else {
            return;
        };

        let sessions = self.table.drain();
        if !sessions.is_empty() {
            info!("Closing {} open session(s)", sessions.len());
        }
        for session in sessions {
            session.close(&self.config);
        }

        drop(transport);
        info!("Session manager shut down");
    }
}

impl<T: UsbTransport> Drop for SessionManager<T> {
    fn drop(&mut self) {
        self.exit();
    }
}

fn check_config(config: &SessionConfig) -> Result<()> {
    config
        .validate()
        .map_err(|e| Error::Config(format!("{:#}", e)))
}

fn validate_serial(serial: &str) -> Result<()> {
    if serial.is_empty() {
        return Err(Error::InvalidParameter(
            "serial number must not be empty".to_string(),
        ));
    }
    if serial.len() >= MAX_STRING_LENGTH {
        return Err(Error::InvalidParameter(format!(
            "serial number longer than {} bytes",
            MAX_STRING_LENGTH - 1
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{SimDevice, SimulatedBus};

    fn manager(bus: &SimulatedBus) -> SessionManager<SimulatedBus> {
        let mut config = SessionConfig::default();
        config.transfer.poll_timeout_ms = 10;
        SessionManager::with_transport(bus.clone(), config).unwrap()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = SessionConfig::default();
        config.buffer.capacity = 0;
        assert!(matches!(
            SessionManager::with_transport(SimulatedBus::new(), config),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_serial_validation() {
        let bus = SimulatedBus::new();
        let mgr = manager(&bus);
        assert!(matches!(mgr.open(""), Err(Error::InvalidParameter(_))));
        assert!(matches!(
            mgr.open(&"x".repeat(MAX_STRING_LENGTH)),
            Err(Error::InvalidParameter(_))
        ));

        assert!(matches!(mgr.close(""), Err(Error::InvalidParameter(_))));
        assert!(matches!(mgr.read("", 8), Err(Error::InvalidParameter(_))));
        assert!(matches!(
            mgr.start_reader(""),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            mgr.stop_reader(""),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(mgr.stats(""), Err(Error::InvalidParameter(_))));
        assert!(!mgr.is_open(""));
    }

    #[test]
    fn test_failed_open_frees_slot() {
        let bus = SimulatedBus::new();
        let mgr = manager(&bus);

        assert!(matches!(mgr.open("A1"), Err(Error::NotFound(_))));
        assert!(!mgr.is_open("A1"));

        bus.add_device(SimDevice::matching("A1"));
        mgr.open("A1").unwrap();
        assert!(mgr.is_open("A1"));
    }

    #[test]
    fn test_exit_is_idempotent() {
        let bus = SimulatedBus::new();
        bus.add_device(SimDevice::matching("A1"));
        let mut mgr = manager(&bus);
        mgr.open("A1").unwrap();

        mgr.exit();
        assert!(!mgr.is_initialized());
        assert_eq!(bus.open_handles(), 0);
        mgr.exit();

        assert!(matches!(mgr.scan(4), Err(Error::NotInitialized)));
        assert!(matches!(mgr.open("A1"), Err(Error::NotInitialized)));
        assert!(matches!(mgr.read("A1", 4), Err(Error::NotInitialized)));
        assert!(matches!(mgr.close("A1"), Err(Error::NotInitialized)));
    }

    #[test]
    fn test_drop_closes_sessions() {
        let bus = SimulatedBus::new();
        bus.add_device(SimDevice::matching("A1"));
        {
            let mgr = manager(&bus);
            mgr.open("A1").unwrap();
            assert_eq!(bus.open_handles(), 1);
        }
        assert_eq!(bus.open_handles(), 0);
        assert_eq!(bus.claimed_interfaces(), 0);
        assert_eq!(bus.reads_in_flight(), 0);
    }
}
