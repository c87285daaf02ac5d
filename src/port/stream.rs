//! Blocking stream primitives consumed from concrete transports.
//!
//! A UART, an RFCOMM socket, a USB bulk endpoint or a TCP client all reduce
//! to a source half, a sink half and (sometimes) a line-control handle.

use super::error::PortError;
use std::io::{Read, Write};
use std::time::Duration;

/// Blocking read half of a byte stream.
pub trait ByteSource: Send {
    /// Read into `buffer`.
    ///
    /// `Ok(0)` means end of stream. Implementations should return a
    /// transient error (see [`PortError::is_transient`]) after a bounded
    /// wait so the reader can observe a concurrent close.
    fn read_bytes(&mut self, buffer: &mut [u8]) -> Result<usize, PortError>;
}

/// Blocking write half of a byte stream.
pub trait ByteSink: Send {
    /// Write some prefix of `data`, returning its length.
    fn write_bytes(&mut self, data: &[u8]) -> Result<usize, PortError>;

    fn flush(&mut self) -> Result<(), PortError> {
        Ok(())
    }
}

/// Line settings of a stream that has them.
pub trait LineControl: Send {
    fn baud_rate(&self) -> u32;

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<(), PortError>;
}

/// The two halves of an opened stream.
pub struct StreamPair {
    pub source: Box<dyn ByteSource>,
    pub sink: Box<dyn ByteSink>,
    pub control: Option<Box<dyn LineControl>>,
}

impl StreamPair {
    pub fn new(source: Box<dyn ByteSource>, sink: Box<dyn ByteSink>) -> Self {
        Self {
            source,
            sink,
            control: None,
        }
    }

    pub fn with_control(mut self, control: Box<dyn LineControl>) -> Self {
        self.control = Some(control);
        self
    }
}

impl std::fmt::Debug for StreamPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamPair")
            .field("has_control", &self.control.is_some())
            .finish()
    }
}

/// Adapts any `std::io::Read` (sockets, serial handles) into a [`ByteSource`].
pub struct IoSource<R>(pub R);

impl<R: Read + Send> ByteSource for IoSource<R> {
    fn read_bytes(&mut self, buffer: &mut [u8]) -> Result<usize, PortError> {
        self.0.read(buffer).map_err(PortError::Io)
    }
}

/// Adapts any `std::io::Write` into a [`ByteSink`].
pub struct IoSink<W>(pub W);

impl<W: Write + Send> ByteSink for IoSink<W> {
    fn write_bytes(&mut self, data: &[u8]) -> Result<usize, PortError> {
        self.0.write(data).map_err(PortError::Io)
    }

    fn flush(&mut self) -> Result<(), PortError> {
        self.0.flush().map_err(PortError::Io)
    }
}

/// Default bound on a single blocking read, so closes are noticed promptly.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(250);

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_io_source_reads_and_reports_eof() {
        let mut source = IoSource(Cursor::new(b"abc".to_vec()));
        let mut buffer = [0u8; 8];
        assert_eq!(source.read_bytes(&mut buffer).unwrap(), 3);
        assert_eq!(&buffer[..3], b"abc");
        assert_eq!(source.read_bytes(&mut buffer).unwrap(), 0);
    }

    #[test]
    fn test_io_sink_writes() {
        let mut sink = IoSink(Vec::new());
        assert_eq!(sink.write_bytes(b"xyz").unwrap(), 3);
        sink.flush().unwrap();
        assert_eq!(sink.0, b"xyz");
    }
}
