//! # GPIB Session Library
//!
//! Typed sessions for IEEE-488 (GPIB) instruments over the linux-gpib
//! driver, with every driver call turned into a structured result.
//!
//! The driver reports the outcome of each call through process-global
//! status variables. This crate captures them into a [`StatusSnapshot`]
//! right after the call, translates failures into [`GpibError`] values
//! whose message names the failing driver entry point and a human-readable
//! reason, and keeps the last snapshot per thread for
//! [`last_status`]/[`last_count`].
//!
//! ## Features
//!
//! - **Structured errors** - `"ibrd failed: <reason>"`, with OS errors described from `errno`
//! - **Device locking** - sessions opened by name lock the device node against other processes
//! - **Safe lifecycle** - closed sessions fail fast; dropping a session closes it
//! - **Pluggable driver** - [`Driver`] is implemented by linux-gpib and by an in-process [`sim`] bus
//! - **Instrument helpers** - `*IDN?`, error queue draining, bus commands
//!
//! ## Quick Start
//!
//! ```no_run
//! # #[cfg(feature = "linux-gpib")]
//! fn main() -> gpib_session::Result<()> {
//!     use gpib_session::{DeviceConfig, Gpib};
//!
//!     let gpib = Gpib::linux();
//!
//!     // Instrument at primary address 3 on board 0
//!     let session = gpib.open(&DeviceConfig::new(0, 3))?;
//!     session.write(b"*IDN?")?;
//!     println!("{}", session.read_text(128)?);
//!
//!     Ok(())
//! }
//! # #[cfg(not(feature = "linux-gpib"))]
//! # fn main() {}
//! ```
//!
//! ## Cargo features
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `linux-gpib` | Links `libgpib` and provides `LinuxGpib` |
//! | `serde` | Serialize/deserialize configuration and replies |
//! | `napi` | Node.js binding with the flat descriptor API |
//!
//! ## Error Handling
//!
//! ```
//! use std::sync::Arc;
//! use gpib_session::sim::{MemoryLocks, SimulatedBus};
//! use gpib_session::{DeviceConfig, Gpib, GpibError};
//!
//! let gpib = Gpib::new(Arc::new(SimulatedBus::new()), Arc::new(MemoryLocks::new()));
//! let session = gpib.open(&DeviceConfig::new(0, 12)).unwrap();
//!
//! // Nobody listens at address 12.
//! match session.write(b"*RST") {
//!     Err(GpibError::DriverRejected { operation, reason, .. }) => {
//!         assert_eq!(operation, "ibwrt");
//!         assert!(reason.contains("no listeners"));
//!     }
//!     other => panic!("unexpected: {:?}", other),
//! }
//! ```

#![warn(clippy::all)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod command;
mod config;
mod driver;
mod error;
mod instrument;
mod lock;
mod session;
pub mod sim;
mod status;
pub mod translate;

#[cfg(feature = "linux-gpib")]
mod linux;

#[cfg(feature = "napi")]
mod binding;

// Public re-exports
pub use config::{ConfigOption, DeviceConfig, EosFlags, Timeout, MAX_ADDRESS};
pub use driver::Driver;
pub use error::{GpibError, Result};
pub use instrument::{Controller, DeviceError, Identity, Instrument, DEFAULT_REPLY_LEN};
pub use lock::{
    Acquire, DeviceLock, LockDir, LockToken, DEFAULT_LOCK_DIR, LOCK_DIR_ENV, UNREADABLE_GRACE,
};
pub use session::{Gpib, Session, SessionState};
pub use status::{last_count, last_status, Status, StatusSnapshot};

#[cfg(feature = "linux-gpib")]
pub use linux::LinuxGpib;
