//! Buffered writer worker.
//!
//! `write()` copies into a bounded buffer on the caller's thread; a dedicated
//! worker performs the blocking sink writes. A zero write timeout makes the
//! writer lossy: a full buffer fails the call instead of stalling it, which
//! keeps one slow peer from holding up a fan-out.

use super::error::PortError;
use super::stream::ByteSink;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Sizing and timing of a [`BufferedWriter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterConfig {
    /// Buffer capacity in bytes.
    pub capacity: usize,
    /// How long `write()` may wait for space. Zero means lossy.
    pub write_timeout: Duration,
    /// How long `drain()` may wait for the buffer to empty.
    pub drain_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            capacity: 4096,
            write_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
struct WriterState {
    buffer: Box<[u8]>,
    /// First unconsumed byte.
    head: usize,
    /// One past the last queued byte.
    tail: usize,
    closed: bool,
    failure: Option<String>,
}

impl WriterState {
    fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Shift the unconsumed region to offset 0.
    fn compact(&mut self) {
        if self.head == 0 {
            return;
        }
        self.buffer.copy_within(self.head..self.tail, 0);
        self.tail -= self.head;
        self.head = 0;
    }
}

type FailureHook = Box<dyn Fn(PortError) + Send + Sync>;

struct WriterShared {
    name: String,
    config: WriterConfig,
    state: Mutex<WriterState>,
    changed: Condvar,
    on_failure: FailureHook,
}

/// Bounded, timeout-aware write buffer drained by a worker thread.
pub struct BufferedWriter {
    shared: Arc<WriterShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BufferedWriter {
    /// Start a worker writing to `sink`.
    ///
    /// `on_failure` runs on the worker thread after a sink write fails; the
    /// failure also surfaces from the next `write()` or `drain()`.
    pub fn spawn<F>(
        name: impl Into<String>,
        sink: Box<dyn ByteSink>,
        config: WriterConfig,
        on_failure: F,
    ) -> Result<Self, PortError>
    where
        F: Fn(PortError) + Send + Sync + 'static,
    {
        if config.capacity == 0 {
            return Err(PortError::config("writer capacity must be positive"));
        }

        let shared = Arc::new(WriterShared {
            name: name.into(),
            config,
            state: Mutex::new(WriterState {
                buffer: vec![0u8; config.capacity].into_boxed_slice(),
                head: 0,
                tail: 0,
                closed: false,
                failure: None,
            }),
            changed: Condvar::new(),
            on_failure: Box::new(on_failure),
        });

        let worker = {
            let shared = shared.clone();
            thread::Builder::new()
                .name(format!("writer:{}", shared.name))
                .spawn(move || run(shared, sink))?
        };

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn config(&self) -> WriterConfig {
        self.shared.config
    }

    /// Queue as much of `data` as fits and return how many bytes were taken.
    pub fn write(&self, data: &[u8]) -> Result<usize, PortError> {
        if data.is_empty() {
            return Ok(0);
        }

        let timeout = self.shared.config.write_timeout;
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();

        loop {
            if state.closed {
                return Err(PortError::NotOpen);
            }
            if let Some(message) = &state.failure {
                return Err(PortError::write_failed(message.clone()));
            }

            let capacity = state.buffer.len();
            if state.tail == capacity {
                state.compact();
            }

            let free = capacity - state.tail;
            if free > 0 {
                let n = free.min(data.len());
                let tail = state.tail;
                state.buffer[tail..tail + n].copy_from_slice(&data[..n]);
                state.tail += n;
                self.shared.changed.notify_all();
                return Ok(n);
            }

            if timeout.is_zero() {
                return Err(PortError::timeout(timeout));
            }
            if self
                .shared
                .changed
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return Err(PortError::timeout(timeout));
            }
        }
    }

    /// Wait until every queued byte has reached the sink.
    pub fn drain(&self) -> Result<(), PortError> {
        let timeout = self.shared.config.drain_timeout;
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();

        loop {
            if let Some(message) = &state.failure {
                return Err(PortError::write_failed(message.clone()));
            }
            if state.is_empty() {
                return Ok(());
            }
            if state.closed {
                return Err(PortError::NotOpen);
            }
            if self
                .shared
                .changed
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return if state.is_empty() {
                    Ok(())
                } else {
                    Err(PortError::timeout(timeout))
                };
            }
        }
    }

    /// Number of bytes queued but not yet written.
    pub fn pending(&self) -> usize {
        let state = self.shared.state.lock();
        state.tail - state.head
    }

    /// Stop the worker, wake every blocked caller, and join the worker.
    pub fn close(&self) {
        {
            let mut state = self.shared.state.lock();
            state.closed = true;
            self.shared.changed.notify_all();
        }

        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            warn!("writer {} worker panicked", self.shared.name);
        }
    }
}

impl Drop for BufferedWriter {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for BufferedWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedWriter")
            .field("name", &self.shared.name)
            .field("pending", &self.pending())
            .finish()
    }
}

fn run(shared: Arc<WriterShared>, mut sink: Box<dyn ByteSink>) {
    let mut chunk = Vec::with_capacity(shared.config.capacity);

    loop {
        {
            let mut state = shared.state.lock();
            while state.is_empty() && !state.closed {
                shared.changed.wait(&mut state);
            }
            if state.closed {
                break;
            }
            chunk.clear();
            chunk.extend_from_slice(&state.buffer[state.head..state.tail]);
        }

        let mut written = 0;
        while written < chunk.len() {
            match sink.write_bytes(&chunk[written..]) {
                Ok(0) => {
                    fail(&shared, PortError::Io(std::io::ErrorKind::WriteZero.into()));
                    return;
                }
                Ok(n) => {
                    written += n;
                    // compaction may have moved the region, but only relative
                    // to head, so advancing head stays correct
                    let mut state = shared.state.lock();
                    state.head += n;
                    if state.is_empty() {
                        state.head = 0;
                        state.tail = 0;
                    }
                    shared.changed.notify_all();
                }
                Err(e) if e.is_transient() => {
                    if shared.state.lock().closed {
                        return;
                    }
                }
                Err(e) => {
                    fail(&shared, e);
                    return;
                }
            }
        }
    }

    if let Err(e) = sink.flush() {
        debug!("writer {} flush on close failed: {}", shared.name, e);
    }
}

fn fail(shared: &WriterShared, error: PortError) {
    warn!("writer {} failed: {}", shared.name, error);
    {
        let mut state = shared.state.lock();
        if state.closed {
            return;
        }
        state.failure = Some(error.to_string());
        state.head = 0;
        state.tail = 0;
        shared.changed.notify_all();
    }
    (shared.on_failure)(error);
}
