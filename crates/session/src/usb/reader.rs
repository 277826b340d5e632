//! Background reader task
//!
//! One dedicated thread per session repeatedly issues short-timeout inbound
//! transfers and appends whatever arrives to the session's ring buffer. The
//! caller drains the buffer on its own schedule.
//!
//! The thread's only exit condition is the stop signal. Timeouts are the
//! normal idle case; any other transfer error is logged, counted and retried
//! after one poll interval, so a broken device shows up as empty reads rather
//! than a dead thread. The stop channel is checked before every transfer, so
//! a stop request is observed within one poll timeout.

use crate::config::{SessionConfig, TransferKind};
use crate::ring_buffer::RingBuffer;
use async_channel::{Receiver, Sender, TryRecvError};
use common::{Error, Result, TransportError, TransportHandle};
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, TryLockError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Lifecycle of a session's reader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    Stopped,
    Running,
    StopRequested,
}

const STOPPED: u8 = 0;
const RUNNING: u8 = 1;
const STOP_REQUESTED: u8 = 2;

impl ReaderState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            RUNNING => ReaderState::Running,
            STOP_REQUESTED => ReaderState::StopRequested,
            _ => ReaderState::Stopped,
        }
    }
}

/// What to poll and how
#[derive(Debug, Clone, Copy)]
pub struct ReaderSettings {
    pub endpoint: u8,
    pub packet_size: usize,
    pub timeout: Duration,
    pub kind: TransferKind,
}

impl From<&SessionConfig> for ReaderSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            endpoint: config.transfer.in_endpoint,
            packet_size: config.transfer.packet_size,
            timeout: config.poll_timeout(),
            kind: config.transfer.kind,
        }
    }
}

/// Counters updated by the reader thread, readable from any thread
///
/// Shared per session so they survive reader restarts.
#[derive(Debug, Default)]
pub struct ReaderCounters {
    pub polls: AtomicU64,
    pub bytes_received: AtomicU64,
    pub transfer_errors: AtomicU64,
}

/// Handle to a running reader thread
///
/// Dropping it stops and joins the thread, so no reader ever outlives the
/// session that spawned it.
pub struct ReaderTask {
    serial: String,
    stop_tx: Sender<()>,
    state: Arc<AtomicU8>,
    join: Option<JoinHandle<()>>,
}

impl ReaderTask {
    /// Spawn the reader thread for one session
    pub fn spawn<H: TransportHandle>(
        serial: &str,
        handle: Arc<H>,
        buffer: Arc<RingBuffer>,
        counters: Arc<ReaderCounters>,
        settings: ReaderSettings,
    ) -> Result<Self> {
        let (stop_tx, stop_rx) = async_channel::bounded(1);
        let state = Arc::new(AtomicU8::new(RUNNING));

        let thread_state = Arc::clone(&state);
        let thread_serial = serial.to_string();
        let join = std::thread::Builder::new()
            .name(format!("usb-reader-{}", serial))
            .spawn(move || {
                run_reader(
                    &thread_serial,
                    &*handle,
                    &buffer,
                    &counters,
                    settings,
                    &stop_rx,
                );
                thread_state.store(STOPPED, Ordering::Release);
            })
            .map_err(|e| Error::ResourceExhausted(format!("failed to spawn reader thread: {}", e)))?;

        Ok(Self {
            serial: serial.to_string(),
            stop_tx,
            state,
            join: Some(join),
        })
    }

    pub fn state(&self) -> ReaderState {
        ReaderState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Signal the thread and block until it has exited
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(join) = self.join.take() else {
            return;
        };

        self.state.store(STOP_REQUESTED, Ordering::Release);
        // A full channel already carries a stop request
        let _ = self.stop_tx.try_send(());

        if join.join().is_err() {
            error!("Reader thread for {} panicked", self.serial);
        }
        self.state.store(STOPPED, Ordering::Release);
        debug!("Reader for {} joined", self.serial);
    }
}

impl Drop for ReaderTask {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Owner of a session's reader, at most one at a time
///
/// A stop keeps the slot locked until the thread has been joined, so a
/// concurrent close waits for it and a concurrent start sees `Busy`.
#[derive(Default)]
pub struct ReaderSlot {
    task: Mutex<Option<ReaderTask>>,
}

impl ReaderSlot {
    /// Install a reader built by `spawn`
    ///
    /// Fails with `Busy` if one is running or a stop is still joining.
    pub fn start(&self, serial: &str, spawn: impl FnOnce() -> Result<ReaderTask>) -> Result<()> {
        let mut task = match self.task.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                return Err(Error::Busy(format!("reader for {} is stopping", serial)));
            }
        };

        if task.is_some() {
            return Err(Error::Busy(format!("reader already running for {}", serial)));
        }

        *task = Some(spawn()?);
        Ok(())
    }

    /// Stop and join the reader, if any
    ///
    /// Blocks while another stop is joining, then finds the slot empty.
    pub fn stop(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(reader) = task.take() {
            reader.stop();
        }
    }

    pub fn state(&self) -> ReaderState {
        match self.task.try_lock() {
            Ok(task) => task.as_ref().map_or(ReaderState::Stopped, ReaderTask::state),
            Err(TryLockError::Poisoned(poisoned)) => poisoned
                .into_inner()
                .as_ref()
                .map_or(ReaderState::Stopped, ReaderTask::state),
            // Only a pending stop holds the lock for longer than a spawn
            Err(TryLockError::WouldBlock) => ReaderState::StopRequested,
        }
    }
}

fn run_reader<H: TransportHandle>(
    serial: &str,
    handle: &H,
    buffer: &RingBuffer,
    counters: &ReaderCounters,
    settings: ReaderSettings,
    stop_rx: &Receiver<()>,
) {
    info!(
        "Reader for {} started (endpoint {:#04x}, {:?}, {} byte packets, timeout {}ms)",
        serial,
        settings.endpoint,
        settings.kind,
        settings.packet_size,
        settings.timeout.as_millis()
    );

    let mut packet = vec![0u8; settings.packet_size];
    let mut consecutive_errors: u64 = 0;

    loop {
        match stop_rx.try_recv() {
            Ok(()) | Err(TryRecvError::Closed) => break,
            Err(TryRecvError::Empty) => {}
        }

        let result = match settings.kind {
            TransferKind::Interrupt => {
                handle.read_interrupt(settings.endpoint, &mut packet, settings.timeout)
            }
            TransferKind::Bulk => handle.read_bulk(settings.endpoint, &mut packet, settings.timeout),
        };
        counters.polls.fetch_add(1, Ordering::Relaxed);

        match result {
            Ok(len) => {
                if consecutive_errors > 0 {
                    info!(
                        "Reader for {} recovered after {} failed transfers",
                        serial, consecutive_errors
                    );
                    consecutive_errors = 0;
                }
                if len == 0 {
                    continue;
                }

                counters
                    .bytes_received
                    .fetch_add(len as u64, Ordering::Relaxed);
                let stored = buffer.write(&packet[..len]);
                trace!(
                    "Reader for {}: received {} bytes, buffered {}, {} pending",
                    serial,
                    len,
                    stored,
                    buffer.len()
                );
            }
            Err(TransportError::Timeout) => {
                // Idle device
            }
            Err(e) => {
                counters.transfer_errors.fetch_add(1, Ordering::Relaxed);
                consecutive_errors += 1;
                if consecutive_errors == 1 {
                    warn!(
                        "Inbound transfer failed for {}: {} ({})",
                        serial,
                        e,
                        e.name()
                    );
                } else {
                    debug!(
                        "Inbound transfer failed for {}: {} ({} in a row)",
                        serial,
                        e.name(),
                        consecutive_errors
                    );
                }
                // Don't spin on a dead endpoint
                std::thread::sleep(settings.timeout);
            }
        }
    }

    info!("Reader for {} stopped", serial);
}
