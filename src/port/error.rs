//! Port-specific error types.
//!
//! Transport failures never cross the port boundary as panics; they are
//! returned from `write`/`drain` or converted into state transitions.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during port operations.
#[derive(Debug, Error)]
pub enum PortError {
    /// The specified device was not found on the system.
    #[error("Device not found: {0}")]
    NotFound(String),

    /// An I/O error occurred on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Port configuration failed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation timed out.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The port has been closed.
    #[error("Port is not open")]
    NotOpen,

    /// No active transport is available right now.
    #[error("Port has no active transport")]
    NotConnected,

    /// A previous asynchronous write failed; reported once.
    #[error("Asynchronous write failed: {0}")]
    WriteFailed(String),

    /// The peer does not offer what this port needs. Not retried.
    #[error("Incompatible device: {0}")]
    Incompatible(String),

    /// A serialport-specific error occurred.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

impl PortError {
    /// Create a NotFound error from a device name.
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound(name.into())
    }

    /// Create a Config error from a message.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a Timeout error from a duration.
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout(duration)
    }

    /// Create a WriteFailed error from a message.
    pub fn write_failed(message: impl Into<String>) -> Self {
        Self::WriteFailed(message.into())
    }

    /// Returns true for read errors that only mean "nothing arrived yet".
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}
