//! Core trait for the port abstraction.
//!
//! Defines the `Port` trait implemented by every transport, so serial,
//! Bluetooth, TCP and shared-link ports can be used interchangeably.

use super::error::PortError;
use super::state::{HealthState, InputListener, PortListener};
use super::writer::WriterConfig;
use crate::config::IoConfig;
use std::sync::Arc;
use std::time::Duration;

/// Bidirectional byte-stream endpoint over one transport.
///
/// All methods take `&self`: ports are shared between the application, their
/// own worker threads and transport callbacks.
pub trait Port: Send + Sync {
    /// Current health. Never blocks.
    fn state(&self) -> HealthState;

    /// Replace the state listener.
    fn set_listener(&self, listener: Option<Arc<dyn PortListener>>);

    /// Replace the input listener.
    fn set_input_listener(&self, listener: Option<Arc<dyn InputListener>>);

    /// Queue bytes for sending.
    ///
    /// Returns how many bytes were accepted, which may be fewer than
    /// requested. `Err(PortError::NotConnected)` means there is no active
    /// transport right now; check [`state`](Self::state) to decide whether to
    /// retry or give up.
    fn write(&self, data: &[u8]) -> Result<usize, PortError>;

    /// Block until queued bytes have been sent, within a bounded timeout.
    fn drain(&self) -> Result<(), PortError>;

    /// Current line speed, or 0 where that has no meaning.
    fn baud_rate(&self) -> u32 {
        0
    }

    /// Change the line speed. Transports without one accept and ignore it.
    fn set_baud_rate(&self, _baud_rate: u32) -> Result<(), PortError> {
        Ok(())
    }

    /// Release the transport.
    ///
    /// Idempotent, callable from any thread including from inside a listener
    /// callback. No listener is invoked after it returns.
    fn close(&self);

    /// Write all of `data`, retrying partial accepts.
    fn write_all(&self, mut data: &[u8]) -> Result<(), PortError> {
        while !data.is_empty() {
            let n = self.write(data)?;
            if n == 0 {
                return Err(PortError::timeout(Duration::ZERO));
            }
            data = &data[n..];
        }
        Ok(())
    }
}

/// Buffer sizing shared by stream-backed ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortOptions {
    /// Maximum bytes delivered per input callback.
    pub read_chunk_size: usize,
    /// Write-side buffering.
    pub writer: WriterConfig,
}

impl PortOptions {
    /// Same buffers, but a full write buffer fails immediately.
    pub fn lossy(mut self) -> Self {
        self.writer.write_timeout = Duration::ZERO;
        self
    }
}

impl Default for PortOptions {
    fn default() -> Self {
        Self {
            read_chunk_size: 1024,
            writer: WriterConfig::default(),
        }
    }
}

impl From<&IoConfig> for PortOptions {
    fn from(config: &IoConfig) -> Self {
        Self {
            read_chunk_size: config.read_chunk_size,
            writer: WriterConfig {
                capacity: config.write_buffer_size,
                write_timeout: config.write_timeout(),
                drain_timeout: config.drain_timeout(),
            },
        }
    }
}
