//! Translation of driver status into structured results.
//!
//! After every call the driver leaves its verdict in the status snapshot.
//! [`check`] turns that snapshot into either the snapshot itself (success,
//! carrying the byte count and status word) or a
//! [`GpibError::DriverRejected`] whose message reads
//! `"<operation> failed: <reason>"`.
//!
//! The reason is derived as follows:
//!
//! 1. [`EDVR`] and [`EFSO`] mean the failure happened below the driver, in
//!    the OS. The reason is then the description of the OS error number
//!    captured with the snapshot.
//! 2. Any other code is looked up in [`ERROR_CATALOG`] (first match wins).
//! 3. Codes missing from the catalog give `"unknown reason (code: <n>)"`.
//!
//! # Example
//!
//! ```
//! use gpib_session::{translate, Status, StatusSnapshot};
//!
//! let snapshot = StatusSnapshot::failed(Status::empty(), translate::ENOL, None);
//! let err = translate::check("ibwrt", snapshot).unwrap_err();
//! assert!(err.to_string().starts_with("ibwrt failed: You have attempted to write"));
//! ```

use std::io;

use crate::error::{GpibError, Result};
use crate::status::StatusSnapshot;

/// A system call has failed.
pub const EDVR: i32 = 0;
/// Board is not controller-in-charge.
pub const ECIC: i32 = 1;
/// No listeners addressed.
pub const ENOL: i32 = 2;
/// Board failed to address itself.
pub const EADR: i32 = 3;
/// Invalid argument.
pub const EARG: i32 = 4;
/// Board is not system controller.
pub const ESAC: i32 = 5;
/// I/O aborted (timeout or device clear).
pub const EABO: i32 = 6;
/// Board does not exist.
pub const ENEB: i32 = 7;
/// DMA error.
pub const EDMA: i32 = 8;
/// Asynchronous I/O in progress.
pub const EOIP: i32 = 10;
/// Capability missing or disabled.
pub const ECAP: i32 = 11;
/// File system error.
pub const EFSO: i32 = 12;
/// Command bytes timed out.
pub const EBUS: i32 = 14;
/// Serial poll status bytes lost.
pub const ESTB: i32 = 15;
/// SRQ line stuck on.
pub const ESRQ: i32 = 16;
/// Table problem (`ibevent`, `FindLstn`, `FindRQS`).
pub const ETAB: i32 = 20;

/// Error catalog: driver error code, mnemonic and explanation.
pub const ERROR_CATALOG: &[(i32, &str, &str)] = &[
    (EDVR, "EDVR", "A system call has failed. ibcnt/ibcntl will be set to the value of errno."),
    (ECIC, "ECIC", "Your interface board needs to be controller-in-charge, but is not."),
    (ENOL, "ENOL", "You have attempted to write data or command bytes, but there are no listeners currently addressed."),
    (EADR, "EADR", "The interface board has failed to address itself properly before starting an io operation."),
    (EARG, "EARG", "One or more arguments to the function call were invalid."),
    (ESAC, "ESAC", "The interface board needs to be system controller, but is not."),
    (EABO, "EABO", "A read or write of data bytes has been aborted, possibly due to a timeout or reception of a device clear command."),
    (ENEB, "ENEB", "The GPIB interface board does not exist, its driver is not loaded, or it is not configured properly."),
    (EDMA, "EDMA", "Not used (DMA error), included for compatibility purposes."),
    (EOIP, "EOIP", "Function call can not proceed due to an asynchronous IO operation (ibrda(), ibwrta(), or ibcmda()) in progress."),
    (ECAP, "ECAP", "Incapable of executing function call, due the GPIB board lacking the capability, or the capability being disabled in software."),
    (EFSO, "EFSO", "File system error. ibcnt/ibcntl will be set to the value of errno."),
    (EBUS, "EBUS", "An attempt to write command bytes to the bus has timed out."),
    (ESTB, "ESTB", "One or more serial poll status bytes have been lost. This can occur due to too many status bytes accumulating (through automatic serial polling) without being read."),
    (ESRQ, "ESRQ", "The serial poll request service line is stuck on."),
    (ETAB, "ETAB", "This error can be returned by ibevent(), FindLstn(), or FindRQS(). See their descriptions for more information."),
];

/// Returns the catalog explanation for an error code.
///
/// # Example
///
/// ```
/// use gpib_session::translate::{error_description, EARG};
///
/// assert_eq!(
///     error_description(EARG),
///     Some("One or more arguments to the function call were invalid.")
/// );
/// assert_eq!(error_description(99), None);
/// ```
pub fn error_description(code: i32) -> Option<&'static str> {
    ERROR_CATALOG
        .iter()
        .find(|(c, _, _)| *c == code)
        .map(|(_, _, text)| *text)
}

/// Returns the mnemonic (`"EABO"`, ...) for an error code.
pub fn error_name(code: i32) -> Option<&'static str> {
    ERROR_CATALOG
        .iter()
        .find(|(c, _, _)| *c == code)
        .map(|(_, name, _)| *name)
}

/// Returns whether the code means the failure originated in the OS.
pub fn is_os_error(code: i32) -> bool {
    code == EDVR || code == EFSO
}

/// Describes an OS error number the way `strerror` would.
pub fn os_error_description(errno: i32) -> String {
    io::Error::from_raw_os_error(errno).to_string()
}

/// Produces the failure reason for a driver error code.
///
/// `os_error` is consulted only for the OS-delegated codes.
///
/// # Example
///
/// ```
/// use gpib_session::translate::diagnose;
///
/// assert_eq!(diagnose(42, None), "unknown reason (code: 42)");
/// ```
pub fn diagnose(code: i32, os_error: Option<i32>) -> String {
    if is_os_error(code) {
        if let Some(errno) = os_error {
            return os_error_description(errno);
        }
    }
    match error_description(code) {
        Some(text) => text.to_string(),
        None => format!("unknown reason (code: {})", code),
    }
}

/// Builds the `DriverRejected` error for a failed snapshot.
pub fn rejection(operation: &'static str, snapshot: &StatusSnapshot) -> GpibError {
    GpibError::driver_rejected(
        operation,
        snapshot.error,
        diagnose(snapshot.error, snapshot.os_error),
    )
}

/// Converts a snapshot into a result for the named operation.
///
/// # Errors
///
/// Returns `GpibError::DriverRejected` when the snapshot has `ERR` set.
pub fn check(operation: &'static str, snapshot: StatusSnapshot) -> Result<StatusSnapshot> {
    if snapshot.is_error() {
        Err(rejection(operation, &snapshot))
    } else {
        Ok(snapshot)
    }
}
