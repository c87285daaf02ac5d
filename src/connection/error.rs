//! Connection-lifecycle error types.

use crate::port::PortError;
use thiserror::Error;

/// Errors raised while establishing or holding a shared hardware link.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The factory could not open a connection.
    #[error("Failed to open link: {0}")]
    Open(String),

    /// The attempt was cancelled by `disable()` or `shutdown()`.
    #[error("Connection attempt cancelled")]
    Cancelled,

    /// The peer did not complete the reset handshake.
    #[error("Reset handshake failed: {0}")]
    Reset(String),

    /// The agent has been shut down.
    #[error("Connection agent is shut down")]
    ShutDown,

    /// A port-level failure on the link.
    #[error(transparent)]
    Port(#[from] PortError),

    /// The worker thread could not be started.
    #[error("Failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),
}

impl LinkError {
    pub fn open(message: impl Into<String>) -> Self {
        Self::Open(message.into())
    }

    pub fn reset(message: impl Into<String>) -> Self {
        Self::Reset(message.into())
    }
}
