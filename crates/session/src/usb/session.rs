//! Open device session
//!
//! A session owns one open handle with its interface claimed, the ring
//! buffer the reader fills, and at most one reader task. Opening runs
//! configure, claim and activate in that order; any failure undoes the steps
//! that already succeeded, and the handle itself closes when it drops.

use crate::config::SessionConfig;
use crate::ring_buffer::RingBuffer;
use crate::usb::reader::{ReaderCounters, ReaderSettings, ReaderSlot, ReaderState, ReaderTask};
use bytes::Bytes;
use common::{Error, Result, TransportHandle};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

/// Point-in-time view of one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub serial: String,
    /// Bytes waiting to be read
    pub buffered: usize,
    pub capacity: usize,
    pub bytes_received: u64,
    /// Bytes lost to ring buffer overflow
    pub bytes_dropped: u64,
    pub transfer_errors: u64,
    pub polls: u64,
    pub reader: ReaderState,
}

pub struct Session<H: TransportHandle> {
    serial: String,
    handle: Arc<H>,
    interface: u8,
    buffer: Arc<RingBuffer>,
    counters: Arc<ReaderCounters>,
    reader: Arc<ReaderSlot>,
}

impl<H: TransportHandle> Session<H> {
    /// Bring an opened handle into session state
    pub fn establish(mut handle: H, serial: String, config: &SessionConfig) -> Result<Self> {
        let buffer = RingBuffer::new(config.buffer.capacity, config.buffer.overflow)?;
        let interface = config.device.interface;

        handle
            .set_configuration(config.device.configuration)
            .map_err(|e| {
                warn!(
                    "Failed to set configuration {} on {}: {}",
                    config.device.configuration, serial, e
                );
                Error::transport("set configuration", e)
            })?;

        handle.claim_interface(interface).map_err(|e| {
            warn!("Failed to claim interface {} on {}: {}", interface, serial, e);
            Error::transport("claim interface", e)
        })?;

        if config.handshake.enabled {
            if let Err(e) = handle.write_bulk(
                config.transfer.out_endpoint,
                &[config.handshake.open_command],
                config.handshake_timeout(),
            ) {
                warn!("Activate command failed on {}: {}", serial, e);
                if let Err(release_err) = handle.release_interface(interface) {
                    debug!(
                        "Failed to release interface {} on {}: {}",
                        interface, serial, release_err
                    );
                }
                return Err(Error::transport("send activate command", e));
            }
        }

        info!("Session established for {}", serial);

        Ok(Self {
            serial,
            handle: Arc::new(handle),
            interface,
            buffer: Arc::new(buffer),
            counters: Arc::new(ReaderCounters::default()),
            reader: Arc::new(ReaderSlot::default()),
        })
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn reader_state(&self) -> ReaderState {
        self.reader.state()
    }

    /// Spawn the background reader; errors with `Busy` if one is running
    /// or still being stopped
    pub fn start_reader(&self, config: &SessionConfig) -> Result<()> {
        self.reader.start(&self.serial, || {
            ReaderTask::spawn(
                &self.serial,
                Arc::clone(&self.handle),
                Arc::clone(&self.buffer),
                Arc::clone(&self.counters),
                ReaderSettings::from(config),
            )
        })
    }

    /// Shared reader slot, so a stop can be joined without holding a table lock
    pub fn reader_slot(&self) -> Arc<ReaderSlot> {
        Arc::clone(&self.reader)
    }

    /// Drain up to `max_len` buffered bytes
    pub fn read(&self, max_len: usize) -> Bytes {
        self.buffer.read(max_len)
    }

    pub fn stats(&self) -> SessionStats {
        let ring = self.buffer.stats();
        SessionStats {
            serial: self.serial.clone(),
            buffered: ring.len,
            capacity: ring.capacity,
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            bytes_dropped: ring.total_dropped,
            transfer_errors: self.counters.transfer_errors.load(Ordering::Relaxed),
            polls: self.counters.polls.load(Ordering::Relaxed),
            reader: self.reader_state(),
        }
    }

    /// Tear the session down
    ///
    /// Stops the reader first, so no transfer is in flight when the
    /// interface is released. Every step is best effort: failures are
    /// logged and the handle is closed regardless.
    pub fn close(mut self, config: &SessionConfig) {
        // Also waits out a stop that is joining on another thread
        self.reader.stop();

        if config.handshake.enabled {
            if let Err(e) = self.handle.write_bulk(
                config.transfer.out_endpoint,
                &[config.handshake.close_command],
                config.handshake_timeout(),
            ) {
                debug!("Deactivate command failed on {}: {}", self.serial, e);
            }
        }

        match Arc::get_mut(&mut self.handle) {
            Some(handle) => {
                if let Err(e) = handle.release_interface(self.interface) {
                    warn!(
                        "Failed to release interface {} on {}: {}",
                        self.interface, self.serial, e
                    );
                }
            }
            None => warn!(
                "Handle for {} still shared, skipping interface release",
                self.serial
            ),
        }

        info!("Session closed for {}", self.serial);
        // Dropping self closes the handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{BusEvent, SimDevice, SimHandle, SimulatedBus};
    use common::{TransportError, UsbTransport};

    fn open_handle(bus: &SimulatedBus, serial: &str) -> SimHandle {
        bus.add_device(SimDevice::matching(serial));
        let devices = bus.devices().unwrap();
        bus.open(&devices[0]).unwrap()
    }

    #[test]
    fn test_establish_sequence() {
        let bus = SimulatedBus::new();
        let handle = open_handle(&bus, "A1");
        let config = SessionConfig::default();

        let session = Session::establish(handle, "A1".to_string(), &config).unwrap();
        assert_eq!(session.serial(), "A1");
        assert_eq!(session.reader_state(), ReaderState::Stopped);
        assert_eq!(bus.claimed_interfaces(), 1);
        assert_eq!(bus.bulk_out_payloads("A1"), vec![vec![0x01]]);

        session.close(&config);
        assert_eq!(bus.claimed_interfaces(), 0);
        assert_eq!(bus.open_handles(), 0);
        assert_eq!(bus.bulk_out_payloads("A1"), vec![vec![0x01], vec![0x00]]);

        let events = bus.events();
        let released = events
            .iter()
            .position(|e| matches!(e, BusEvent::Released { .. }))
            .unwrap();
        let closed = events
            .iter()
            .position(|e| matches!(e, BusEvent::Closed { .. }))
            .unwrap();
        assert!(released < closed);
    }

    #[test]
    fn test_failed_activate_releases_interface() {
        let bus = SimulatedBus::new();
        let handle = open_handle(&bus, "A1");
        bus.fail_bulk_out("A1", TransportError::Pipe);

        let result = Session::establish(handle, "A1".to_string(), &SessionConfig::default());
        assert!(matches!(
            result,
            Err(Error::Transport {
                source: TransportError::Pipe,
                ..
            })
        ));
        assert_eq!(bus.claimed_interfaces(), 0);
        assert_eq!(bus.open_handles(), 0);
    }

    #[test]
    fn test_failed_claim_closes_handle() {
        let bus = SimulatedBus::new();
        let handle = open_handle(&bus, "A1");
        bus.fail_claim("A1", TransportError::Busy);

        let result = Session::establish(handle, "A1".to_string(), &SessionConfig::default());
        assert!(result.is_err());
        assert_eq!(bus.claimed_interfaces(), 0);
        assert_eq!(bus.open_handles(), 0);
        assert!(bus.bulk_out_payloads("A1").is_empty());
    }

    #[test]
    fn test_handshake_disabled() {
        let bus = SimulatedBus::new();
        let handle = open_handle(&bus, "A1");
        let mut config = SessionConfig::default();
        config.handshake.enabled = false;

        let session = Session::establish(handle, "A1".to_string(), &config).unwrap();
        session.close(&config);
        assert!(bus.bulk_out_payloads("A1").is_empty());
    }

    #[test]
    fn test_start_reader_twice_is_busy() {
        let bus = SimulatedBus::new();
        let handle = open_handle(&bus, "A1");
        let mut config = SessionConfig::default();
        config.transfer.poll_timeout_ms = 10;

        let session = Session::establish(handle, "A1".to_string(), &config).unwrap();
        session.start_reader(&config).unwrap();
        assert_eq!(session.reader_state(), ReaderState::Running);
        assert!(matches!(
            session.start_reader(&config),
            Err(Error::Busy(_))
        ));

        session.close(&config);
        assert_eq!(bus.reads_in_flight(), 0);
        assert_eq!(bus.claimed_interfaces(), 0);
    }
}
