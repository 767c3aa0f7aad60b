//! Custom error types for the enclosure hardware core.
//!
//! This module defines the primary error type, `IebError`, for the whole crate.
//! Using the `thiserror` crate, it gives every device link the same way of
//! reporting what went wrong, so the dispatch layer can report per-device
//! failures without string matching.
//!
//! ## Error Hierarchy
//!
//! - **`InvalidCommand`**: a command name or command/device-class pair that is not
//!   in the fixed command tables. Raised before any I/O is attempted.
//! - **`Connection`** / **`Timeout`**: the endpoint could not be reached, or did not
//!   answer within the command-specific deadline.
//! - **`Protocol`**: a reply arrived but does not match the expected frame.
//! - **`Controller`**: the motor controller answered with `ERR`.
//! - **`UnknownDevice`**: a relay, device class or unit that is not configured.
//! - **`InvalidState`**: a move was requested from an indeterminate position.
//! - **`Parse`**: a transducer or depth-gauge reply could not be parsed.
//! - **`Fieldbus`** / **`WriteNotConfirmed`**: register-protocol exceptions and
//!   relay writes whose confirming read disagrees with the request.
//!
//! By using `#[from]`, `IebError` can be created from I/O errors directly,
//! simplifying error handling throughout the crate with the `?` operator.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, IebError>;

/// Errors raised by the device links and the unit-level aggregate.
#[derive(Error, Debug)]
pub enum IebError {
    /// Command name unknown, or not legal for the device class.
    #[error("Invalid command '{command}' for {device}")]
    InvalidCommand {
        /// Device class or link the command was addressed to.
        device: String,
        /// The offending command name.
        command: String,
    },

    /// Failed to open the connection to an endpoint.
    #[error("{device}: failed connecting to {endpoint}: {reason}")]
    Connection {
        /// Device label.
        device: String,
        /// `host:port` of the endpoint.
        endpoint: String,
        /// Underlying cause.
        reason: String,
    },

    /// No complete reply within the deadline.
    #[error("{device}: timed out after {after:?} waiting for {operation}")]
    Timeout {
        /// Device label.
        device: String,
        /// What was being waited for.
        operation: String,
        /// The deadline that expired.
        after: Duration,
    },

    /// Reply did not match the expected frame.
    #[error("{device}: protocol error: {detail}")]
    Protocol {
        /// Device label.
        device: String,
        /// Description including the offending reply.
        detail: String,
    },

    /// Hardware `ERR` reply from a motor controller.
    #[error("{device}: controller replied {reply} to '{command}'")]
    Controller {
        /// Device label.
        device: String,
        /// Command that failed.
        command: String,
        /// The error token returned by the controller.
        reply: String,
    },

    /// Relay, device class or unit not configured.
    #[error("Unknown device '{0}'")]
    UnknownDevice(String),

    /// Operation not permitted from the current state.
    #[error("{device}: invalid state: {detail}")]
    InvalidState {
        /// Device label.
        device: String,
        /// Why the operation was refused.
        detail: String,
    },

    /// Scalar reply could not be parsed.
    #[error("{device}: cannot parse reply {reply:?}")]
    Parse {
        /// Device label.
        device: String,
        /// The raw reply, lossily decoded.
        reply: String,
    },

    /// Register protocol exception or transport failure on the fieldbus.
    #[error("Fieldbus {endpoint}: {detail}")]
    Fieldbus {
        /// `host:port` of the backplane.
        endpoint: String,
        /// Exception code or transport error.
        detail: String,
    },

    /// The confirming read after a relay write disagrees with the request.
    #[error("Relay '{relay}' not confirmed: requested closed={requested}, read {observed}")]
    WriteNotConfirmed {
        /// Logical relay name.
        relay: String,
        /// Requested contact state.
        requested: bool,
        /// State derived from the confirming read.
        observed: bool,
    },

    /// Configuration that cannot be loaded or fails validation.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// I/O error outside the cases above.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl IebError {
    /// Whether a caller-side bounded retry makes sense for this error.
    ///
    /// Transport-level and parse failures are transient; command legality,
    /// controller `ERR` and configuration problems are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IebError::Timeout { .. }
                | IebError::Connection { .. }
                | IebError::Parse { .. }
                | IebError::Io(_)
        )
    }

    /// Whether the error came from a missed deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, IebError::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = IebError::UnknownDevice("lamp_power".to_string());
        assert_eq!(err.to_string(), "Unknown device 'lamp_power'");
    }

    #[test]
    fn test_controller_error_display() {
        let err = IebError::Controller {
            device: "sp1.shutter".into(),
            command: "open".into(),
            reply: "ERR3".into(),
        };
        assert_eq!(
            err.to_string(),
            "sp1.shutter: controller replied ERR3 to 'open'"
        );
    }

    #[test]
    fn test_retry_classification() {
        let timeout = IebError::Timeout {
            device: "b1".into(),
            operation: "pressure".into(),
            after: Duration::from_secs(3),
        };
        assert!(timeout.is_retryable());
        assert!(timeout.is_timeout());

        let invalid = IebError::InvalidCommand {
            device: "hartmann_left".into(),
            command: "flash".into(),
        };
        assert!(!invalid.is_retryable());
    }
}
