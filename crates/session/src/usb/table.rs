//! Serial-keyed session table
//!
//! Each serial moves through `Opening -> Open -> Closing` and back out of
//! the map. The transitional slots let blocking USB work run without the
//! table lock held while still refusing a second open or close of the same
//! serial.

use crate::usb::session::{Session, SessionStats};
use common::{Error, Result, TransportHandle};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

enum Slot<H: TransportHandle> {
    Opening,
    Open(Session<H>),
    Closing,
}

/// Observable state of a serial's slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Opening,
    Open,
    Closing,
}

impl<H: TransportHandle> Slot<H> {
    fn state(&self) -> SlotState {
        match self {
            Slot::Opening => SlotState::Opening,
            Slot::Open(_) => SlotState::Open,
            Slot::Closing => SlotState::Closing,
        }
    }
}

pub struct SessionTable<H: TransportHandle> {
    slots: RwLock<HashMap<String, Slot<H>>>,
    max_sessions: Option<usize>,
}

impl<H: TransportHandle> SessionTable<H> {
    pub fn new(max_sessions: Option<usize>) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            max_sessions,
        }
    }

    fn read_slots(&self) -> RwLockReadGuard<'_, HashMap<String, Slot<H>>> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_slots(&self) -> RwLockWriteGuard<'_, HashMap<String, Slot<H>>> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `serial` for an open in progress
    ///
    /// The slot stays `Opening` until the reservation is committed; dropping
    /// an uncommitted reservation frees it again.
    pub fn reserve(&self, serial: &str) -> Result<Reservation<'_, H>> {
        let mut slots = self.write_slots();

        if let Some(slot) = slots.get(serial) {
            return Err(Error::Busy(match slot.state() {
                SlotState::Open => format!("device {} is already open", serial),
                SlotState::Opening => format!("device {} is being opened", serial),
                SlotState::Closing => format!("device {} is being closed", serial),
            }));
        }

        if let Some(max) = self.max_sessions {
            if slots.len() >= max {
                return Err(Error::ResourceExhausted(format!(
                    "session limit of {} reached",
                    max
                )));
            }
        }

        slots.insert(serial.to_string(), Slot::Opening);
        debug!("Reserved session slot for {}", serial);

        Ok(Reservation {
            table: self,
            serial: serial.to_string(),
            committed: false,
        })
    }

    /// Move an open session into `Closing` and hand it to the caller
    ///
    /// Must be followed by [`finish_close`](Self::finish_close).
    pub fn begin_close(&self, serial: &str) -> Result<Session<H>> {
        let mut slots = self.write_slots();

        let slot = slots
            .get_mut(serial)
            .ok_or_else(|| Error::NotFound(format!("no session for {}", serial)))?;

        match std::mem::replace(slot, Slot::Closing) {
            Slot::Open(session) => Ok(session),
            other => {
                let state = other.state();
                *slot = other;
                Err(Error::Busy(format!(
                    "device {} is in state {:?}",
                    serial, state
                )))
            }
        }
    }

    pub fn finish_close(&self, serial: &str) {
        let mut slots = self.write_slots();
        if let Some(Slot::Closing) = slots.get(serial) {
            slots.remove(serial);
        }
    }

    /// Run `f` against an open session under the shared lock
    pub fn with_session<R>(&self, serial: &str, f: impl FnOnce(&Session<H>) -> R) -> Result<R> {
        match self.read_slots().get(serial) {
            Some(Slot::Open(session)) => Ok(f(session)),
            _ => Err(not_open(serial)),
        }
    }

    pub fn stats(&self, serial: &str) -> Result<SessionStats> {
        self.with_session(serial, Session::stats)
    }

    pub fn state(&self, serial: &str) -> Option<SlotState> {
        self.read_slots().get(serial).map(Slot::state)
    }

    pub fn contains(&self, serial: &str) -> bool {
        self.read_slots().contains_key(serial)
    }

    /// Serials with a fully open session, sorted
    pub fn open_serials(&self) -> Vec<String> {
        let mut serials: Vec<String> = self
            .read_slots()
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Open(_)))
            .map(|(serial, _)| serial.clone())
            .collect();
        serials.sort();
        serials
    }

    pub fn len(&self) -> usize {
        self.read_slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empty the table, returning every open session
    pub fn drain(&self) -> Vec<Session<H>> {
        self.write_slots()
            .drain()
            .filter_map(|(_, slot)| match slot {
                Slot::Open(session) => Some(session),
                _ => None,
            })
            .collect()
    }
}

fn not_open(serial: &str) -> Error {
    Error::NotFound(format!("no open session for {}", serial))
}

/// An `Opening` slot held for the duration of an open
pub struct Reservation<'a, H: TransportHandle> {
    table: &'a SessionTable<H>,
    serial: String,
    committed: bool,
}

impl<H: TransportHandle> Reservation<'_, H> {
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Publish the session under the reserved serial
    pub fn commit(mut self, session: Session<H>) {
        let mut slots = self.table.write_slots();
        slots.insert(self.serial.clone(), Slot::Open(session));
        self.committed = true;
    }
}

impl<H: TransportHandle> Drop for Reservation<'_, H> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }

        let mut slots = self.table.write_slots();
        if let Some(Slot::Opening) = slots.get(&self.serial) {
            slots.remove(&self.serial);
            debug!("Released session slot for {}", self.serial);
        }
    }
}
