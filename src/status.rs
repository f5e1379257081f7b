//! The driver's status word and the per-call status snapshot.
//!
//! linux-gpib publishes the outcome of every call through three
//! process-wide variables: `ibsta` (status bits), `ibcnt`/`ibcntl`
//! (bytes transferred, or `errno` after a system error) and `iberr`
//! (error code, meaningful only when `ERR` is set). A [`StatusSnapshot`]
//! is a copy of those values taken immediately after the call that
//! produced them.
//!
//! # Example
//!
//! ```
//! use gpib_session::Status;
//!
//! let sta = Status::from_raw(0x2100);
//! assert!(sta.completed());
//! assert!(sta.ended());
//! assert!(!sta.errored());
//! assert_eq!(sta.to_string(), "< CMPL END >");
//! ```

use std::cell::Cell;
use std::fmt;

use bitflags::bitflags;

bitflags! {
    /// Bits of the `ibsta` status word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[repr(transparent)]
    pub struct Status: u16 {
        /// Device clear received.
        const DCAS = 0x1;
        /// Device trigger received.
        const DTAS = 0x2;
        /// Board addressed as listener.
        const LACS = 0x4;
        /// Board addressed as talker.
        const TACS = 0x8;
        /// ATN line asserted.
        const ATN = 0x10;
        /// Board is controller-in-charge.
        const CIC = 0x20;
        /// Board is in remote state.
        const REM = 0x40;
        /// Board is in lockout state.
        const LOK = 0x80;
        /// I/O completed.
        const CMPL = 0x100;
        /// Event queue not empty.
        const EVENT = 0x200;
        /// Board has been serial polled.
        const SPOLL = 0x400;
        /// Device requested service.
        const RQS = 0x800;
        /// SRQ line asserted.
        const SRQI = 0x1000;
        /// END (EOI or EOS) detected.
        const END = 0x2000;
        /// Time limit exceeded.
        const TIMO = 0x4000;
        /// Error; `iberr` holds the code.
        const ERR = 0x8000;
    }
}

impl Status {
    /// Builds a status word from the raw `ibsta` value, keeping unknown bits.
    pub fn from_raw(raw: i32) -> Self {
        Self::from_bits_retain(raw as u16)
    }

    /// Returns the raw `ibsta` value.
    pub fn raw(self) -> i32 {
        i32::from(self.bits())
    }

    /// I/O completed.
    pub fn completed(self) -> bool {
        self.contains(Self::CMPL)
    }

    /// END was detected on the last read.
    pub fn ended(self) -> bool {
        self.contains(Self::END)
    }

    /// The operation timed out.
    pub fn timed_out(self) -> bool {
        self.contains(Self::TIMO)
    }

    /// The driver flagged the call as failed.
    pub fn errored(self) -> bool {
        self.contains(Self::ERR)
    }

    /// A device requested service.
    pub fn service_requested(self) -> bool {
        self.contains(Self::RQS)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<")?;
        for (name, _) in self.iter_names() {
            write!(f, " {}", name)?;
        }
        f.write_str(" >")
    }
}

/// The driver's global status, copied right after a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusSnapshot {
    /// Status bits (`ibsta`).
    pub status: Status,
    /// Byte count (`ibcntl`).
    pub count: usize,
    /// Error code (`iberr`); only meaningful when `status` has `ERR`.
    pub error: i32,
    /// OS error number captured at failure detection, if any.
    pub os_error: Option<i32>,
}

impl StatusSnapshot {
    /// Snapshot of a successful call.
    pub fn ok(status: Status, count: usize) -> Self {
        Self {
            status: status - Status::ERR,
            count,
            error: 0,
            os_error: None,
        }
    }

    /// Snapshot of a failed call with the given driver error code.
    pub fn failed(status: Status, error: i32, os_error: Option<i32>) -> Self {
        Self {
            status: status | Status::ERR,
            count: 0,
            error,
            os_error,
        }
    }

    /// Returns whether the snapshot reports a failure.
    pub fn is_error(&self) -> bool {
        self.status.errored()
    }
}

thread_local! {
    static LAST: Cell<StatusSnapshot> = Cell::new(StatusSnapshot::default());
}

pub(crate) fn record(snapshot: StatusSnapshot) {
    LAST.with(|last| last.set(snapshot));
}

/// Returns the status word of the most recent driver call made on this thread.
///
/// Only meaningful immediately after that call; any further call
/// replaces it.
pub fn last_status() -> Status {
    LAST.with(|last| last.get().status)
}

/// Returns the byte count of the most recent driver call made on this thread.
pub fn last_count() -> usize {
    LAST.with(|last| last.get().count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_lists_set_bits() {
        assert_eq!(Status::empty().to_string(), "< >");
        assert_eq!(
            (Status::CMPL | Status::ERR | Status::TIMO).to_string(),
            "< CMPL TIMO ERR >"
        );
    }

    #[test]
    fn test_from_raw_keeps_bits() {
        let sta = Status::from_raw(0xC100);
        assert!(sta.errored());
        assert!(sta.timed_out());
        assert!(sta.completed());
        assert_eq!(sta.raw(), 0xC100);
    }

    #[test]
    fn test_snapshot_constructors() {
        let ok = StatusSnapshot::ok(Status::CMPL | Status::ERR, 5);
        assert!(!ok.is_error());
        assert_eq!(ok.count, 5);

        let failed = StatusSnapshot::failed(Status::TIMO, 6, None);
        assert!(failed.is_error());
        assert_eq!(failed.error, 6);
    }

    #[test]
    fn test_last_snapshot_is_per_thread() {
        record(StatusSnapshot::ok(Status::CMPL, 12));
        assert_eq!(last_count(), 12);
        assert_eq!(last_status(), Status::CMPL);

        let other = std::thread::spawn(last_count).join().unwrap();
        assert_eq!(other, 0);
    }
}
