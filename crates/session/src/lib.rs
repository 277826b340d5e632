//! Serial-addressed USB device sessions
//!
//! Discovers instances of one USB peripheral (by VID/PID), opens them by
//! serial number and runs a background reader per open device that fills a
//! bounded ring buffer. Callers drain the buffer with non-blocking reads.
//!
//! ```no_run
//! use usb_session::{SessionConfig, SessionManager};
//!
//! # fn main() -> common::Result<()> {
//! let config = SessionConfig::load_or_default();
//! common::setup_logging(&config.log_level)?;
//!
//! let mut manager = SessionManager::init(config)?;
//! for device in manager.scan(16)? {
//!     println!("{} ({} {})", device.serial, device.manufacturer, device.product);
//! }
//!
//! manager.open("A1")?;
//! let data = manager.read("A1", 64)?;
//! println!("{} bytes", data.len());
//! manager.close("A1")?;
//! manager.exit();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod manager;
pub mod ring_buffer;
pub mod usb;

pub use config::{SessionConfig, TransferKind, load_config};
pub use manager::SessionManager;
pub use ring_buffer::{OverflowPolicy, RingBuffer, RingStats};
pub use usb::{ReaderState, RusbTransport, SessionStats};
