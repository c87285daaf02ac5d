//! Mock byte stream for testing.
//!
//! Provides a `MockStream` that simulates a serial-like device without
//! hardware. Tests feed incoming bytes, inspect written bytes, stall the
//! sink, hang up the source, or inject write failures.

use super::error::PortError;
use super::stream::{ByteSink, ByteSource, LineControl, StreamPair};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Inner state of the mock stream, shared by all of its halves.
#[derive(Debug, Default)]
struct MockStreamState {
    /// Bytes waiting to be returned by reads.
    incoming: VecDeque<u8>,
    /// Every successful sink write, in order.
    write_log: Vec<Vec<u8>>,
    /// The source reports end of stream once `incoming` is empty.
    hung_up: bool,
    /// Sink writes time out instead of accepting data.
    stalled: bool,
    /// Maximum bytes one sink write accepts (0 = unlimited).
    max_write: usize,
    /// The next sink write fails with this message.
    fail_next_write: Option<String>,
    /// Current line speed.
    baud_rate: u32,
    /// Every baud rate applied through the control half.
    baud_history: Vec<u32>,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<MockStreamState>,
    changed: Condvar,
}

/// Mock stream implementation for testing.
///
/// # Example
/// ```
/// use flightlink::port::{ByteSink, ByteSource, MockStream};
///
/// let stream = MockStream::new("MOCK0");
/// stream.push_incoming(b"$GPGGA");
///
/// let mut source = stream.source();
/// let mut buffer = [0u8; 16];
/// let n = source.read_bytes(&mut buffer).unwrap();
/// assert_eq!(&buffer[..n], b"$GPGGA");
///
/// let mut sink = stream.sink();
/// sink.write_bytes(b"PFLX").unwrap();
/// assert_eq!(stream.written(), b"PFLX");
/// ```
#[derive(Clone)]
pub struct MockStream {
    name: String,
    read_timeout: Duration,
    shared: Arc<Shared>,
}

impl MockStream {
    /// Create a new mock stream with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        let shared = Arc::new(Shared::default());
        shared.state.lock().baud_rate = 9600;
        Self {
            name: name.into(),
            read_timeout: Duration::from_millis(20),
            shared,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue bytes for the source half.
    pub fn push_incoming(&self, data: &[u8]) {
        let mut state = self.shared.state.lock();
        state.incoming.extend(data);
        self.shared.changed.notify_all();
    }

    /// Make the source report end of stream after queued bytes.
    pub fn hang_up(&self) {
        self.shared.state.lock().hung_up = true;
        self.shared.changed.notify_all();
    }

    /// Make sink writes time out until [`resume`](Self::resume).
    pub fn stall(&self) {
        self.shared.state.lock().stalled = true;
    }

    pub fn resume(&self) {
        self.shared.state.lock().stalled = false;
        self.shared.changed.notify_all();
    }

    /// Limit how many bytes a single sink write accepts.
    pub fn set_max_write(&self, max: usize) {
        self.shared.state.lock().max_write = max;
    }

    /// Fail the next sink write.
    pub fn fail_next_write(&self, message: impl Into<String>) {
        self.shared.state.lock().fail_next_write = Some(message.into());
    }

    /// Get a copy of every sink write.
    pub fn write_log(&self) -> Vec<Vec<u8>> {
        self.shared.state.lock().write_log.clone()
    }

    /// All written bytes, concatenated.
    pub fn written(&self) -> Vec<u8> {
        self.shared.state.lock().write_log.concat()
    }

    pub fn baud_history(&self) -> Vec<u32> {
        self.shared.state.lock().baud_history.clone()
    }

    /// Get the number of bytes still queued for reading.
    pub fn available_bytes(&self) -> usize {
        self.shared.state.lock().incoming.len()
    }

    pub fn source(&self) -> MockSource {
        MockSource(self.clone())
    }

    pub fn sink(&self) -> MockSink {
        MockSink(self.clone())
    }

    pub fn control(&self) -> MockControl {
        MockControl(self.clone())
    }

    /// All three halves, as a transport would hand them over.
    pub fn pair(&self) -> StreamPair {
        StreamPair::new(Box::new(self.source()), Box::new(self.sink()))
            .with_control(Box::new(self.control()))
    }
}

impl std::fmt::Debug for MockStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockStream")
            .field("name", &self.name)
            .field("available_bytes", &self.available_bytes())
            .finish()
    }
}

/// Read half of a [`MockStream`].
pub struct MockSource(MockStream);

impl ByteSource for MockSource {
    fn read_bytes(&mut self, buffer: &mut [u8]) -> Result<usize, PortError> {
        let shared = &self.0.shared;
        let mut state = shared.state.lock();

        if state.incoming.is_empty() && !state.hung_up {
            shared.changed.wait_for(&mut state, self.0.read_timeout);
        }

        if state.incoming.is_empty() {
            if state.hung_up {
                return Ok(0);
            }
            return Err(PortError::timeout(self.0.read_timeout));
        }

        let n = buffer.len().min(state.incoming.len());
        for (slot, byte) in buffer.iter_mut().zip(state.incoming.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

/// Write half of a [`MockStream`].
pub struct MockSink(MockStream);

impl ByteSink for MockSink {
    fn write_bytes(&mut self, data: &[u8]) -> Result<usize, PortError> {
        let shared = &self.0.shared;
        let mut state = shared.state.lock();

        if let Some(message) = state.fail_next_write.take() {
            return Err(PortError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                message,
            )));
        }

        if state.stalled {
            shared.changed.wait_for(&mut state, self.0.read_timeout);
            if state.stalled {
                return Err(PortError::timeout(self.0.read_timeout));
            }
        }

        let n = match state.max_write {
            0 => data.len(),
            max => data.len().min(max),
        };
        state.write_log.push(data[..n].to_vec());
        Ok(n)
    }
}

/// Line-control half of a [`MockStream`].
pub struct MockControl(MockStream);

impl LineControl for MockControl {
    fn baud_rate(&self) -> u32 {
        self.0.shared.state.lock().baud_rate
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<(), PortError> {
        if baud_rate == 0 {
            return Err(PortError::config("baud rate must be positive"));
        }
        let mut state = self.0.shared.state.lock();
        state.baud_rate = baud_rate;
        state.baud_history.push(baud_rate);
        Ok(())
    }
}
