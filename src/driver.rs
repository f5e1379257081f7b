//! The GPIB driver surface consumed by sessions.
//!
//! The driver layer only knows descriptors, bytes and status words. It
//! does not interpret failures. Every method returns the
//! [`StatusSnapshot`] captured immediately after the underlying call, so
//! the driver's process-global status never outlives the call that
//! produced it.
//!
//! Two implementations ship with the crate:
//!
//! - `LinuxGpib` (feature `linux-gpib`), the linux-gpib C library
//! - [`SimulatedBus`](crate::sim::SimulatedBus), an in-process bus for tests

use crate::config::Timeout;
use crate::status::{Status, StatusSnapshot};

/// Operations exposed by a GPIB driver.
///
/// Descriptors are opaque small integers. A negative descriptor from
/// [`find`](Driver::find) or [`dev`](Driver::dev) means failure.
pub trait Driver: Send + Sync {
    /// Opens a board or device by its configured name (`ibfind`).
    fn find(&self, name: &str) -> (i32, StatusSnapshot);

    /// Opens a device by bus address (`ibdev`).
    fn dev(&self, board: i32, pad: i32, sad: i32, tmo: i32, eot: i32, eos: i32)
        -> (i32, StatusSnapshot);

    /// Reads up to `buf.len()` bytes (`ibrd`). The snapshot count is the
    /// number of bytes stored.
    fn read(&self, ud: i32, buf: &mut [u8]) -> StatusSnapshot;

    /// Writes `data` (`ibwrt`).
    fn write(&self, ud: i32, data: &[u8]) -> StatusSnapshot;

    /// Starts an asynchronous write (`ibwrta`). The driver owns `data`
    /// until the transfer completes.
    fn write_async(&self, ud: i32, data: Vec<u8>) -> StatusSnapshot;

    /// Sends command bytes (`ibcmd`).
    fn command(&self, ud: i32, data: &[u8]) -> StatusSnapshot;

    /// Sets or clears the REN line (`ibsre`).
    fn remote_enable(&self, ud: i32, enable: bool) -> StatusSnapshot;

    /// Sends a selected device clear (`ibclr`).
    fn clear(&self, ud: i32) -> StatusSnapshot;

    /// Pulses IFC (`SendIFC`). The driver reports nothing for it.
    fn interface_clear(&self, ud: i32);

    /// Brings a descriptor online or takes it offline (`ibonl`).
    fn online(&self, ud: i32, online: bool) -> StatusSnapshot;

    /// Queries a configuration option (`ibask`).
    fn ask(&self, ud: i32, option: i32) -> (i32, StatusSnapshot);

    /// Sets a configuration option (`ibconfig`).
    fn config(&self, ud: i32, option: i32, value: i32) -> StatusSnapshot;

    /// Waits for any of the `mask` bits (`ibwait`).
    fn wait(&self, ud: i32, mask: Status) -> StatusSnapshot;

    /// Sets the I/O timeout class (`ibtmo`).
    fn timeout(&self, ud: i32, timeout: Timeout) -> StatusSnapshot;

    /// Serial polls a device (`ibrsp`).
    fn serial_poll(&self, ud: i32) -> (u8, StatusSnapshot);

    /// Sends a group execute trigger (`ibtrg`).
    fn trigger(&self, ud: i32) -> StatusSnapshot;
}
