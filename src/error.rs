//! Error types for GPIB sessions.

use std::io;
use thiserror::Error;

use crate::instrument::DeviceError;
use crate::translate::EABO;

/// Result type alias for GPIB operations.
pub type Result<T> = std::result::Result<T, GpibError>;

/// Errors that can occur while talking to the GPIB driver.
#[derive(Debug, Error)]
pub enum GpibError {
    /// The driver reported `ERR` in the status word for the attempted operation.
    #[error("{operation} failed: {reason}")]
    DriverRejected {
        /// Driver entry point that failed (e.g. `ibrd`).
        operation: &'static str,
        /// Driver error code (`iberr`) at the time of failure.
        code: i32,
        /// Human-readable diagnosis.
        reason: String,
    },

    /// The device node is locked by another process.
    #[error("device locked by process {owner}")]
    LockHeld {
        /// Process id of the lock holder.
        owner: u32,
    },

    /// The device lock could not be acquired for an OS-level reason.
    #[error("device lock failed: {0}")]
    LockFailed(#[source] io::Error),

    /// The session's descriptor has already been released.
    #[error("session closed (descriptor {descriptor})")]
    SessionClosed {
        /// Descriptor the session held before it was closed.
        descriptor: i32,
    },

    /// The receive buffer for a read could not be allocated.
    #[error("cannot allocate {requested} bytes for read buffer")]
    AllocationFailed {
        /// Requested buffer size in bytes.
        requested: usize,
    },

    /// An instrument reply could not be parsed.
    #[error("Invalid response: {reason}")]
    InvalidResponse {
        /// Description of what was wrong with the reply.
        reason: String,
    },

    /// The instrument reported errors in its error queue.
    #[error("instrument reported {} error(s): {}", .errors.len(), .errors.first().map(ToString::to_string).unwrap_or_default())]
    DeviceErrors {
        /// Drained error queue, oldest first.
        errors: Vec<DeviceError>,
    },

    /// Invalid parameter provided.
    #[error("Invalid parameter '{parameter}': {reason}")]
    InvalidParameter {
        /// Name of the invalid parameter.
        parameter: String,
        /// Description of why the parameter is invalid.
        reason: String,
    },
}

impl GpibError {
    /// Creates a new `DriverRejected` error.
    ///
    /// # Example
    ///
    /// ```
    /// use gpib_session::GpibError;
    ///
    /// let err = GpibError::driver_rejected("ibwrt", 2, "no listeners");
    /// assert_eq!(err.to_string(), "ibwrt failed: no listeners");
    /// ```
    pub fn driver_rejected(operation: &'static str, code: i32, reason: impl Into<String>) -> Self {
        Self::DriverRejected {
            operation,
            code,
            reason: reason.into(),
        }
    }

    /// Creates a new `InvalidParameter` error.
    ///
    /// # Example
    ///
    /// ```
    /// use gpib_session::GpibError;
    ///
    /// let err = GpibError::invalid_parameter("pad", "must be 0-30");
    /// ```
    pub fn invalid_parameter(parameter: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new `InvalidResponse` error.
    pub fn invalid_response(reason: impl Into<String>) -> Self {
        Self::InvalidResponse {
            reason: reason.into(),
        }
    }

    /// Returns the driver error code for `DriverRejected`, `None` otherwise.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::DriverRejected { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Returns whether the error is an aborted transfer, which is how the
    /// driver reports an I/O timeout.
    pub fn is_timeout(&self) -> bool {
        self.code() == Some(EABO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_rejected_display() {
        let err = GpibError::driver_rejected("ibrd", 6, "aborted");
        assert_eq!(err.to_string(), "ibrd failed: aborted");
        assert_eq!(err.code(), Some(6));
        assert!(err.is_timeout());
    }

    #[test]
    fn test_lock_held_display() {
        let err = GpibError::LockHeld { owner: 4242 };
        assert_eq!(err.to_string(), "device locked by process 4242");
        assert_eq!(err.code(), None);
    }

    #[test]
    fn test_session_closed_display() {
        let err = GpibError::SessionClosed { descriptor: 3 };
        assert_eq!(err.to_string(), "session closed (descriptor 3)");
    }

    #[test]
    fn test_lock_failed_keeps_source() {
        use std::error::Error as _;

        let err = GpibError::LockFailed(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(err.source().is_some());
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_device_errors_display() {
        let err = GpibError::DeviceErrors {
            errors: vec![
                DeviceError::new(-113, "Undefined header"),
                DeviceError::new(-222, "Data out of range"),
            ],
        };
        assert_eq!(
            err.to_string(),
            "instrument reported 2 error(s): -113, \"Undefined header\""
        );
    }

    #[test]
    fn test_invalid_parameter_display() {
        let err = GpibError::invalid_parameter("pad", "must be 0-30");
        assert_eq!(err.to_string(), "Invalid parameter 'pad': must be 0-30");
    }
}
