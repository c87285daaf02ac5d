//! Chunked, flow-controlled write buffer for BLE GATT characteristics.
//!
//! A GATT characteristic carries at most `mtu` bytes per operation and only
//! one read-or-write operation may be outstanding at a time. Writes land in
//! a fixed ring; the transport's completion callbacks pull the next chunk
//! with [`ChunkedFlowBuffer::begin_write_next_chunk`].
//!
//! The first chunk is not written directly. A characteristic read is issued
//! first and its completion starts the write chain, so a write never races a
//! pending notification or read on the same link.

use super::error::PortError;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// The operations the buffer needs from a GATT link.
///
/// Both calls only start an operation; completion is reported back through
/// [`ChunkedFlowBuffer::begin_write_next_chunk`] or
/// [`ChunkedFlowBuffer::on_write_failed`].
#[cfg_attr(test, mockall::automock)]
pub trait GattCharacteristic: Send + Sync {
    /// Start a read of the data characteristic.
    fn request_read(&self) -> Result<(), PortError>;

    /// Start a write of one chunk, at most `mtu` bytes long.
    fn write_chunk(&self, chunk: &[u8]) -> Result<(), PortError>;
}

/// Default chunk size before the link negotiates a larger one.
pub const DEFAULT_CHUNK_SIZE: usize = 20;

/// Sizing and timing of a [`ChunkedFlowBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowConfig {
    pub capacity: usize,
    pub chunk_size: usize,
    pub write_timeout: Duration,
    pub drain_timeout: Duration,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            chunk_size: DEFAULT_CHUNK_SIZE,
            write_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
struct FlowState {
    buffer: Box<[u8]>,
    head: usize,
    tail: usize,
    chunk_size: usize,
    /// One GATT operation is outstanding.
    busy: bool,
    /// An asynchronous chunk write failed and nobody has been told yet.
    error: Option<String>,
    closed: bool,
}

impl FlowState {
    fn len(&self) -> usize {
        self.tail - self.head
    }

    fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    fn reset(&mut self) {
        self.head = 0;
        self.tail = 0;
    }

    fn compact(&mut self) {
        if self.head > 0 {
            self.buffer.copy_within(self.head..self.tail, 0);
            self.tail -= self.head;
            self.head = 0;
        }
    }
}

/// Bounded ring serialized against a single-operation GATT characteristic.
pub struct ChunkedFlowBuffer {
    link: Arc<dyn GattCharacteristic>,
    config: FlowConfig,
    state: Mutex<FlowState>,
    changed: Condvar,
}

impl ChunkedFlowBuffer {
    pub fn new(link: Arc<dyn GattCharacteristic>, config: FlowConfig) -> Result<Self, PortError> {
        if config.capacity == 0 || config.chunk_size == 0 {
            return Err(PortError::config(
                "flow buffer capacity and chunk size must be positive",
            ));
        }
        Ok(Self {
            link,
            config,
            state: Mutex::new(FlowState {
                buffer: vec![0u8; config.capacity].into_boxed_slice(),
                head: 0,
                tail: 0,
                chunk_size: config.chunk_size,
                busy: false,
                error: None,
                closed: false,
            }),
            changed: Condvar::new(),
        })
    }

    /// Use a newly negotiated chunk size for the following chunks.
    pub fn set_chunk_size(&self, chunk_size: usize) {
        if chunk_size == 0 {
            return;
        }
        self.state.lock().chunk_size = chunk_size;
        debug!("flow buffer chunk size -> {}", chunk_size);
    }

    pub fn chunk_size(&self) -> usize {
        self.state.lock().chunk_size
    }

    /// Bytes buffered and not yet handed to the link.
    pub fn pending(&self) -> usize {
        self.state.lock().len()
    }

    pub fn is_busy(&self) -> bool {
        self.state.lock().busy
    }

    /// Copy as much of `data` as fits, waiting for space if the ring is full.
    ///
    /// May accept fewer bytes than offered; the caller retries the rest. A
    /// pending asynchronous failure is reported (and cleared) before anything
    /// is buffered.
    pub fn write(&self, data: &[u8]) -> Result<usize, PortError> {
        if data.is_empty() {
            return Ok(0);
        }

        let deadline = Instant::now() + self.config.write_timeout;
        let mut state = self.state.lock();

        if state.closed {
            return Err(PortError::NotOpen);
        }
        if let Some(message) = state.error.take() {
            return Err(PortError::write_failed(message));
        }

        while state.len() == state.buffer.len() {
            if self.changed.wait_until(&mut state, deadline).timed_out()
                && state.len() == state.buffer.len()
            {
                return Err(PortError::timeout(self.config.write_timeout));
            }
            if state.closed {
                return Err(PortError::NotOpen);
            }
        }

        state.compact();
        let n = (state.buffer.len() - state.tail).min(data.len());
        let tail = state.tail;
        state.buffer[tail..tail + n].copy_from_slice(&data[..n]);
        state.tail += n;

        let start = !state.busy;
        state.busy = true;
        drop(state);

        if start {
            if let Err(e) = self.link.request_read() {
                warn!("priming read failed: {}", e);
                let mut state = self.state.lock();
                state.busy = false;
                state.reset();
                self.changed.notify_all();
                return Err(e);
            }
        }

        Ok(n)
    }

    /// Called from the link's operation-completion callback.
    ///
    /// Issues the next chunk and returns `true`, or marks the link idle and
    /// returns `false` when nothing is left.
    pub fn begin_write_next_chunk(&self) -> bool {
        let chunk = {
            let mut state = self.state.lock();
            if state.closed || state.is_empty() {
                state.busy = false;
                state.reset();
                self.changed.notify_all();
                return false;
            }

            let n = state.chunk_size.min(state.len());
            let head = state.head;
            let chunk = state.buffer[head..head + n].to_vec();
            state.head += n;
            if state.is_empty() {
                state.reset();
            }
            self.changed.notify_all();
            chunk
        };

        match self.link.write_chunk(&chunk) {
            Ok(()) => true,
            Err(e) => {
                self.on_write_failed(&e.to_string());
                false
            }
        }
    }

    /// Called when a chunk write was rejected.
    ///
    /// Everything still buffered is discarded; the failure is reported by the
    /// next `write()` or `drain()`.
    pub fn on_write_failed(&self, message: &str) {
        warn!("chunk write failed: {}", message);
        let mut state = self.state.lock();
        state.error = Some(message.to_string());
        state.busy = false;
        state.reset();
        self.changed.notify_all();
    }

    /// Wait until the ring is empty and the link idle.
    pub fn drain(&self) -> Result<(), PortError> {
        let deadline = Instant::now() + self.config.drain_timeout;
        let mut state = self.state.lock();

        loop {
            if let Some(message) = state.error.take() {
                return Err(PortError::write_failed(message));
            }
            if state.is_empty() && !state.busy {
                return Ok(());
            }
            if state.closed {
                return Err(PortError::NotOpen);
            }
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                if state.is_empty() && !state.busy && state.error.is_none() {
                    return Ok(());
                }
                return Err(PortError::timeout(self.config.drain_timeout));
            }
        }
    }

    /// Discard buffered bytes and release every blocked caller.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.busy = false;
        state.reset();
        self.changed.notify_all();
    }
}

impl std::fmt::Debug for ChunkedFlowBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ChunkedFlowBuffer")
            .field("capacity", &state.buffer.len())
            .field("pending", &state.len())
            .field("chunk_size", &state.chunk_size)
            .field("busy", &state.busy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    /// Records chunk writes and lets the test drive completions.
    #[derive(Default)]
    struct Recorder {
        reads: Mutex<usize>,
        chunks: Mutex<Vec<Vec<u8>>>,
    }

    impl GattCharacteristic for Recorder {
        fn request_read(&self) -> Result<(), PortError> {
            *self.reads.lock() += 1;
            Ok(())
        }

        fn write_chunk(&self, chunk: &[u8]) -> Result<(), PortError> {
            self.chunks.lock().push(chunk.to_vec());
            Ok(())
        }
    }

    fn buffer(link: Arc<dyn GattCharacteristic>, capacity: usize, chunk_size: usize) -> ChunkedFlowBuffer {
        let config = FlowConfig {
            capacity,
            chunk_size,
            write_timeout: Duration::from_millis(200),
            drain_timeout: Duration::from_millis(200),
        };
        ChunkedFlowBuffer::new(link, config).unwrap()
    }

    #[test]
    fn test_45_bytes_at_mtu_20_gives_three_chunks() {
        let link = Arc::new(Recorder::default());
        let flow = buffer(link.clone(), 256, 20);

        let payload: Vec<u8> = (0..45).collect();
        assert_eq!(flow.write(&payload).unwrap(), 45);
        assert_eq!(*link.reads.lock(), 1);

        while flow.begin_write_next_chunk() {}

        let sizes: Vec<usize> = link.chunks.lock().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![20, 20, 5]);
        assert_eq!(link.chunks.lock().concat(), payload);
        assert!(!flow.is_busy());
        flow.drain().unwrap();
    }

    #[test]
    fn test_only_one_priming_read_while_busy() {
        let link = Arc::new(Recorder::default());
        let flow = buffer(link.clone(), 64, 20);

        flow.write(b"abc").unwrap();
        flow.write(b"def").unwrap();
        assert_eq!(*link.reads.lock(), 1);

        while flow.begin_write_next_chunk() {}
        flow.write(b"ghi").unwrap();
        assert_eq!(*link.reads.lock(), 2);
    }

    #[test]
    fn test_partial_accept_when_nearly_full() {
        let link = Arc::new(Recorder::default());
        let flow = buffer(link, 8, 20);

        assert_eq!(flow.write(b"123456").unwrap(), 6);
        assert_eq!(flow.write(b"abcdef").unwrap(), 2);
        assert_eq!(flow.pending(), 8);
    }

    #[test]
    fn test_full_ring_times_out_instead_of_dropping() {
        let link = Arc::new(Recorder::default());
        let flow = buffer(link, 4, 20);

        assert_eq!(flow.write(b"1234").unwrap(), 4);
        assert!(matches!(flow.write(b"5"), Err(PortError::Timeout(_))));
        assert_eq!(flow.pending(), 4);
    }

    #[test]
    fn test_chunk_size_update_applies_to_next_chunk() {
        let link = Arc::new(Recorder::default());
        let flow = buffer(link.clone(), 256, 20);

        flow.write(&[7u8; 50]).unwrap();
        assert!(flow.begin_write_next_chunk());
        flow.set_chunk_size(100);
        while flow.begin_write_next_chunk() {}

        let sizes: Vec<usize> = link.chunks.lock().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![20, 30]);
    }

    #[test]
    fn test_sticky_error_surfaces_once_on_write() {
        let link = Arc::new(Recorder::default());
        let flow = buffer(link, 64, 20);

        flow.write(b"abcdef").unwrap();
        flow.on_write_failed("GATT_ERROR 133");
        assert_eq!(flow.pending(), 0);
        assert!(!flow.is_busy());

        let err = flow.write(b"x").unwrap_err();
        assert!(err.to_string().contains("133"));
        assert_eq!(flow.write(b"x").unwrap(), 1);
    }

    #[test]
    fn test_sticky_error_surfaces_once_on_drain() {
        let link = Arc::new(Recorder::default());
        let flow = buffer(link, 64, 20);

        flow.write(b"abc").unwrap();
        flow.on_write_failed("rejected");
        assert!(matches!(flow.drain(), Err(PortError::WriteFailed(_))));
        flow.drain().unwrap();
    }

    #[test]
    fn test_immediate_chunk_rejection_sets_sticky_error() {
        let mut link = MockGattCharacteristic::new();
        link.expect_request_read().times(1).returning(|| Ok(()));
        link.expect_write_chunk()
            .times(1)
            .returning(|_| Err(PortError::NotConnected));
        let flow = buffer(Arc::new(link), 64, 20);

        flow.write(b"abc").unwrap();
        assert!(!flow.begin_write_next_chunk());
        assert!(matches!(flow.drain(), Err(PortError::WriteFailed(_))));
    }

    #[test]
    fn test_failed_priming_read_fails_write() {
        let mut link = MockGattCharacteristic::new();
        link.expect_request_read()
            .times(1)
            .returning(|| Err(PortError::NotConnected));
        let flow = buffer(Arc::new(link), 64, 20);

        assert!(flow.write(b"abc").is_err());
        assert!(!flow.is_busy());
        assert_eq!(flow.pending(), 0);
    }

    #[test]
    fn test_writer_blocks_until_callbacks_free_space() {
        struct Signalling(Mutex<mpsc::Sender<Option<Vec<u8>>>>);

        impl GattCharacteristic for Signalling {
            fn request_read(&self) -> Result<(), PortError> {
                let _ = self.0.lock().send(None);
                Ok(())
            }
            fn write_chunk(&self, chunk: &[u8]) -> Result<(), PortError> {
                let _ = self.0.lock().send(Some(chunk.to_vec()));
                Ok(())
            }
        }

        let (tx, rx) = mpsc::channel();
        let flow = Arc::new(buffer(Arc::new(Signalling(Mutex::new(tx))), 8, 3));

        // transport thread: every completed operation triggers the next chunk
        let completer = {
            let flow = flow.clone();
            thread::spawn(move || {
                let mut delivered = Vec::new();
                while let Ok(event) = rx.recv_timeout(Duration::from_millis(500)) {
                    if let Some(chunk) = event {
                        assert!(chunk.len() <= 3);
                        delivered.extend(chunk);
                    }
                    thread::sleep(Duration::from_millis(2));
                    flow.begin_write_next_chunk();
                }
                delivered
            })
        };

        let payload: Vec<u8> = (0..40).collect();
        let mut offset = 0;
        while offset < payload.len() {
            offset += flow.write(&payload[offset..]).unwrap();
        }
        flow.drain().unwrap();
        drop(flow);

        assert_eq!(completer.join().unwrap(), payload);
    }

    #[test]
    fn test_close_releases_blocked_writer() {
        let link = Arc::new(Recorder::default());
        let flow = Arc::new(buffer(link, 2, 20));
        flow.write(b"12").unwrap();

        let blocked = {
            let flow = flow.clone();
            thread::spawn(move || flow.write(b"3"))
        };
        thread::sleep(Duration::from_millis(30));
        flow.close();
        assert!(matches!(blocked.join().unwrap(), Err(PortError::NotOpen)));
    }
}
