//! USB device handling
//!
//! Matching, per-device sessions with their background readers, the
//! serial-keyed session table, and the libusb transport adapter.

pub mod matcher;
pub mod reader;
pub mod rusb_transport;
pub mod session;
pub mod table;

pub use matcher::DeviceMatcher;
pub use reader::{ReaderCounters, ReaderSettings, ReaderSlot, ReaderState, ReaderTask};
pub use rusb_transport::{RusbHandle, RusbTransport};
pub use session::{Session, SessionStats};
pub use table::{Reservation, SessionTable, SlotState};
