//! Buffered reader worker.
//!
//! Pulls from a blocking [`ByteSource`] on a dedicated thread and pushes each
//! non-empty chunk to the current input listener.

use super::error::PortError;
use super::state::{InputListener, ListenerSlot};
use super::stream::ByteSource;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// Why a reader stopped on its own.
#[derive(Debug)]
pub enum ReaderEnd {
    /// The source reported end of stream.
    EndOfStream,
    /// The source failed.
    Failed(PortError),
}

impl std::fmt::Display for ReaderEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EndOfStream => write!(f, "end of stream"),
            Self::Failed(e) => write!(f, "{e}"),
        }
    }
}

type EndHook = Box<dyn Fn(ReaderEnd) + Send + Sync>;

struct ReaderShared {
    name: String,
    closed: AtomicBool,
    listener: Arc<ListenerSlot<dyn InputListener>>,
    on_end: EndHook,
}

/// Worker thread adapting a blocking source to listener pushes.
pub struct BufferedReader {
    shared: Arc<ReaderShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BufferedReader {
    /// Start reading `source` in chunks of up to `chunk_size` bytes.
    ///
    /// `on_end` runs on the worker thread when the source ends or fails,
    /// unless the reader was closed first.
    pub fn spawn<F>(
        name: impl Into<String>,
        source: Box<dyn ByteSource>,
        chunk_size: usize,
        listener: Arc<ListenerSlot<dyn InputListener>>,
        on_end: F,
    ) -> Result<Self, PortError>
    where
        F: Fn(ReaderEnd) + Send + Sync + 'static,
    {
        let shared = Arc::new(ReaderShared {
            name: name.into(),
            closed: AtomicBool::new(false),
            listener,
            on_end: Box::new(on_end),
        });

        let worker = {
            let shared = shared.clone();
            thread::Builder::new()
                .name(format!("reader:{}", shared.name))
                .spawn(move || run(shared, source, chunk_size.max(1)))?
        };

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Stop the worker and wait for it to exit.
    ///
    /// When called from the worker itself (e.g. from a listener) the thread
    /// is detached instead of joined.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);

        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            debug!("reader {} closed from its own worker", self.shared.name);
            return;
        }
        if handle.join().is_err() {
            warn!("reader {} worker panicked", self.shared.name);
        }
    }
}

impl Drop for BufferedReader {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for BufferedReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedReader")
            .field("name", &self.shared.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn run(shared: Arc<ReaderShared>, mut source: Box<dyn ByteSource>, chunk_size: usize) {
    let mut buffer = vec![0u8; chunk_size];
    let is_closed = || shared.closed.load(Ordering::Acquire);

    let end = loop {
        if is_closed() {
            return;
        }

        match source.read_bytes(&mut buffer) {
            Ok(0) => break ReaderEnd::EndOfStream,
            Ok(n) => {
                // the port may have been closed while we were blocked
                if is_closed() {
                    return;
                }
                if let Some(listener) = shared.listener.get() {
                    listener.on_data_received(&buffer[..n]);
                }
            }
            Err(e) if e.is_transient() => continue,
            Err(e) => break ReaderEnd::Failed(e),
        }
    };

    if is_closed() {
        return;
    }
    debug!("reader {} stopped: {}", shared.name, end);
    (shared.on_end)(end);
}
