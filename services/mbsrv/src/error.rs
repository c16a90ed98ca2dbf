//! Error handling for the Modbus ingestion service
//!
//! Transport-open errors surface synchronously from the `listen_*` calls. Connection,
//! port and frame errors never reach the caller: the read loops log them and stop or
//! resync on their own.

use thiserror::Error;

use crate::frame::FrameError;

/// Modbus ingestion service error type
#[derive(Error, Debug, Clone)]
pub enum MbsrvError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Input/Output operation errors
    #[error("IO error: {0}")]
    IoError(String),

    /// TCP listener could not be bound
    #[error("Failed to bind {address}: {reason}")]
    BindError { address: String, reason: String },

    /// Serial device could not be opened
    #[error("Failed to open {device}: {reason}")]
    SerialOpenError { device: String, reason: String },

    /// Frame construction failed
    #[error("Frame error: {0}")]
    FrameError(#[from] FrameError),

    /// The dispatch queue consumer has gone away
    #[error("Dispatch queue closed")]
    QueueClosed,
}

/// Result type alias for the ingestion service
pub type Result<T> = std::result::Result<T, MbsrvError>;

impl MbsrvError {
    pub fn config(msg: impl Into<String>) -> Self {
        MbsrvError::ConfigError(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        MbsrvError::IoError(msg.into())
    }

    pub fn bind(address: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        MbsrvError::BindError {
            address: address.into(),
            reason: reason.to_string(),
        }
    }

    pub fn serial_open(device: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        MbsrvError::SerialOpenError {
            device: device.into(),
            reason: reason.to_string(),
        }
    }
}

// ============================================================================
// From implementations for external error types
// ============================================================================

impl From<std::io::Error> for MbsrvError {
    fn from(err: std::io::Error) -> Self {
        MbsrvError::IoError(err.to_string())
    }
}

impl From<figment::Error> for MbsrvError {
    fn from(err: figment::Error) -> Self {
        MbsrvError::ConfigError(format!("Failed to parse config: {}", err))
    }
}

impl From<tokio_serial::Error> for MbsrvError {
    fn from(err: tokio_serial::Error) -> Self {
        MbsrvError::IoError(err.to_string())
    }
}
