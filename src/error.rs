//! Custom error types for the crate.
//!
//! This module defines the primary error type, `DaqError`. Using the `thiserror`
//! crate, it gives every layer (configuration, serial transport, controller, worker)
//! one consistent way to report failures.
//!
//! ## Error Hierarchy
//!
//! The variants fall into the three categories an operator cares about:
//!
//! - **Connection unavailable**: never an error. A missing or unopenable port makes the
//!   controller fall back to simulation; see `hardware::ConnectionMode`.
//! - **Protocol errors**: `SerialTimeout`, `SerialUnexpectedEof` and `Protocol` come from a
//!   malformed or missing reply and terminate the current acquisition.
//! - **Invalid operations**: `AcquisitionActive`, `UnknownProperty`, `InvalidValue` and
//!   `NotSupported` are raised synchronously by the offending call and never change device
//!   state.
//!
//! By using `#[from]`, `DaqError` can be created from the underlying error types,
//! so the `?` operator works across the crate.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial port not connected")]
    SerialPortNotConnected,

    #[error("Failed to open serial port '{port}': {reason}")]
    SerialOpen { port: String, reason: String },

    #[error("Serial read timeout after {0:?}")]
    SerialTimeout(Duration),

    #[error("Unexpected EOF from serial port")]
    SerialUnexpectedEof,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid operation: {0} while an acquisition is in progress")]
    AcquisitionActive(String),

    #[error("Unknown property '{0}'")]
    UnknownProperty(String),

    #[error("Invalid value for '{name}': {reason}")]
    InvalidValue { name: String, reason: String },

    #[error("Operation not supported in {mode} mode: {operation}")]
    NotSupported { mode: String, operation: String },

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    #[error("Detector not initialised; call ini_detector first")]
    NotInitialized,

    #[error("Acquisition task failed: {0}")]
    Worker(String),
}

impl DaqError {
    /// True for the errors raised because an acquisition currently owns the device.
    pub fn is_invalid_operation(&self) -> bool {
        matches!(self, DaqError::AcquisitionActive(_))
    }

    /// True for failures of the serial conversation itself (timeouts, EOF, bad replies).
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            DaqError::SerialTimeout(_) | DaqError::SerialUnexpectedEof | DaqError::Protocol(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::Protocol("expected a count, got 'abc'".to_string());
        assert_eq!(err.to_string(), "Protocol error: expected a count, got 'abc'");
    }

    #[test]
    fn test_acquisition_active_is_invalid_operation() {
        let err = DaqError::AcquisitionActive("set bin_size".into());
        assert!(err.is_invalid_operation());
        assert!(!err.is_protocol_error());
        assert!(err.to_string().contains("set bin_size"));
    }

    #[test]
    fn test_protocol_errors_are_distinct_from_connection_state() {
        assert!(DaqError::SerialTimeout(Duration::from_secs(1)).is_protocol_error());
        assert!(DaqError::SerialUnexpectedEof.is_protocol_error());
        assert!(!DaqError::SerialPortNotConnected.is_protocol_error());
    }
}
