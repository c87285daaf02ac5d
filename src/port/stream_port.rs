//! Port over a single blocking byte stream.
//!
//! Glues a [`BufferedReader`] and a [`BufferedWriter`] to one [`StreamPair`].
//! Serial adapters, RFCOMM sockets, USB bulk endpoints and TCP clients all
//! end up here.

use super::error::PortError;
use super::reader::{BufferedReader, ReaderEnd};
use super::state::{HealthState, InputListener, ListenerSlot, PortListener, StateCell};
use super::stream::{LineControl, StreamPair};
use super::teardown::SafeTeardown;
use super::traits::{Port, PortOptions};
use super::writer::BufferedWriter;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

struct StreamInner {
    name: String,
    state: StateCell,
    teardown: SafeTeardown,
}

impl StreamInner {
    /// Worker-side failure: report and become `Failed`.
    fn link_lost(&self, message: String) {
        let Some(_guard) = self.teardown.enter() else {
            return;
        };
        warn!("port {}: {}", self.name, message);
        self.state.fail_with(HealthState::Failed, &message);
    }
}

/// Hands reader data to the port's input listener while the port is open.
struct GuardedInput {
    inner: Arc<StreamInner>,
    input: Arc<ListenerSlot<dyn InputListener>>,
}

impl InputListener for GuardedInput {
    fn on_data_received(&self, data: &[u8]) {
        let Some(_guard) = self.inner.teardown.enter() else {
            return;
        };
        if let Some(listener) = self.input.get() {
            listener.on_data_received(data);
        }
    }
}

/// A [`Port`] backed by one opened stream.
pub struct StreamPort {
    inner: Arc<StreamInner>,
    input: Arc<ListenerSlot<dyn InputListener>>,
    reader: BufferedReader,
    writer: BufferedWriter,
    control: Mutex<Option<Box<dyn LineControl>>>,
}

impl StreamPort {
    /// Start the reader and writer workers for `pair`.
    ///
    /// The port is `Ready` as soon as this returns.
    pub fn open(
        name: impl Into<String>,
        pair: StreamPair,
        options: PortOptions,
    ) -> Result<Self, PortError> {
        let name = name.into();
        let inner = Arc::new(StreamInner {
            name: name.clone(),
            state: StateCell::new(HealthState::Ready),
            teardown: SafeTeardown::new(),
        });
        let input: Arc<ListenerSlot<dyn InputListener>> = Arc::new(ListenerSlot::new());

        let writer = {
            let inner = inner.clone();
            BufferedWriter::spawn(name.clone(), pair.sink, options.writer, move |e| {
                inner.link_lost(format!("write failed: {e}"));
            })?
        };

        let reader = {
            let relay: Arc<ListenerSlot<dyn InputListener>> = Arc::new(ListenerSlot::new());
            relay.set(Some(Arc::new(GuardedInput {
                inner: inner.clone(),
                input: input.clone(),
            })));
            let inner = inner.clone();
            BufferedReader::spawn(
                name.clone(),
                pair.source,
                options.read_chunk_size,
                relay,
                move |end| match end {
                    ReaderEnd::EndOfStream => inner.link_lost("connection closed by peer".into()),
                    ReaderEnd::Failed(e) => inner.link_lost(format!("read failed: {e}")),
                },
            )?
        };

        info!("port {} open", name);
        Ok(Self {
            inner,
            input,
            reader,
            writer,
            control: Mutex::new(pair.control),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Bytes queued but not yet handed to the stream.
    pub fn pending(&self) -> usize {
        self.writer.pending()
    }
}

impl Port for StreamPort {
    fn state(&self) -> HealthState {
        self.inner.state.get()
    }

    fn set_listener(&self, listener: Option<Arc<dyn PortListener>>) {
        self.inner.state.listener().set(listener);
    }

    fn set_input_listener(&self, listener: Option<Arc<dyn InputListener>>) {
        self.input.set(listener);
    }

    fn write(&self, data: &[u8]) -> Result<usize, PortError> {
        if self.inner.teardown.is_shutdown() {
            return Err(PortError::NotOpen);
        }
        self.writer.write(data)
    }

    fn drain(&self) -> Result<(), PortError> {
        self.writer.drain()
    }

    fn baud_rate(&self) -> u32 {
        self.control
            .lock()
            .as_ref()
            .map_or(0, |control| control.baud_rate())
    }

    fn set_baud_rate(&self, baud_rate: u32) -> Result<(), PortError> {
        match self.control.lock().as_mut() {
            Some(control) => {
                debug!("port {} baud rate -> {}", self.inner.name, baud_rate);
                control.set_baud_rate(baud_rate)
            }
            None => Ok(()),
        }
    }

    fn close(&self) {
        if !self.inner.teardown.begin_shutdown() {
            self.inner.teardown.wait_closed();
            return;
        }
        self.input.clear();
        self.reader.close();
        self.writer.close();
        self.inner.teardown.finish_shutdown();

        self.inner.state.listener().clear();
        self.inner.state.transition(HealthState::Failed);
        self.control.lock().take();
        self.inner.teardown.mark_closed();
        info!("port {} closed", self.inner.name);
    }
}

impl Drop for StreamPort {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for StreamPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamPort")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::MockStream;
    use crate::port::state::{MockInputListener, MockPortListener};
    use std::sync::mpsc;
    use std::time::Duration;

    fn open(stream: &MockStream) -> StreamPort {
        StreamPort::open(stream.name(), stream.pair(), PortOptions::default()).unwrap()
    }

    #[test]
    fn test_open_is_ready_and_echoes_writes() {
        let stream = MockStream::new("MOCK0");
        let port = open(&stream);
        assert_eq!(port.state(), HealthState::Ready);

        port.write_all(b"$PFLAU,3,1,2,1*4B\r\n").unwrap();
        port.drain().unwrap();
        assert_eq!(stream.written(), b"$PFLAU,3,1,2,1*4B\r\n");
        port.close();
    }

    #[test]
    fn test_input_reaches_listener() {
        let stream = MockStream::new("MOCK0");
        let port = open(&stream);
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);

        let mut listener = MockInputListener::new();
        listener.expect_on_data_received().returning(move |data| {
            let _ = tx.lock().send(data.to_vec());
        });
        port.set_input_listener(Some(Arc::new(listener)));

        stream.push_incoming(b"$GPRMC");
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), b"$GPRMC");
        port.close();
    }

    #[test]
    fn test_peer_hang_up_fails_port() {
        let stream = MockStream::new("MOCK0");
        let port = open(&stream);
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);

        let mut listener = MockPortListener::new();
        listener.expect_on_error().return_const(());
        listener.expect_on_state_changed().returning(move || {
            let _ = tx.lock().send(());
        });
        port.set_listener(Some(Arc::new(listener)));

        stream.hang_up();
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(port.state(), HealthState::Failed);
        port.close();
    }

    #[test]
    fn test_baud_rate_goes_to_control() {
        let stream = MockStream::new("MOCK0");
        let port = open(&stream);
        assert_eq!(port.baud_rate(), 9600);
        port.set_baud_rate(38400).unwrap();
        assert_eq!(port.baud_rate(), 38400);
        assert_eq!(stream.baud_history(), vec![38400]);
        port.close();
        assert_eq!(port.baud_rate(), 0);
    }

    #[test]
    fn test_close_is_idempotent_and_silent() {
        let stream = MockStream::new("MOCK0");
        let port = open(&stream);

        let mut listener = MockPortListener::new();
        listener.expect_on_state_changed().times(0);
        listener.expect_on_error().times(0);
        port.set_listener(Some(Arc::new(listener)));

        port.close();
        port.close();
        assert_eq!(port.state(), HealthState::Failed);
        assert!(matches!(port.write(b"x"), Err(PortError::NotOpen)));
    }

    #[test]
    fn test_close_from_error_callback() {
        struct CloseOnError {
            port: std::sync::Weak<StreamPort>,
            report: Mutex<mpsc::Sender<String>>,
        }
        impl PortListener for CloseOnError {
            fn on_state_changed(&self) {}

            fn on_error(&self, message: &str) {
                if let Some(port) = self.port.upgrade() {
                    port.close();
                }
                let _ = self.report.lock().send(message.to_string());
            }
        }

        let stream = MockStream::new("MOCK0");
        let port = Arc::new(open(&stream));
        let (tx, rx) = mpsc::channel();
        port.set_listener(Some(Arc::new(CloseOnError {
            port: Arc::downgrade(&port),
            report: Mutex::new(tx),
        })));

        stream.fail_next_write("cable pulled");
        port.write_all(b"$PFLAU\r\n").unwrap();

        let message = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(message.contains("cable pulled"));
        port.close();
        assert_eq!(port.state(), HealthState::Failed);
        assert!(matches!(port.write(b"x"), Err(PortError::NotOpen)));
    }

    #[test]
    fn test_second_close_waits_for_input_callback() {
        use std::sync::atomic::{AtomicBool, Ordering};

        struct SlowInput {
            entered: Mutex<mpsc::Sender<()>>,
            finished: AtomicBool,
        }
        impl InputListener for SlowInput {
            fn on_data_received(&self, _data: &[u8]) {
                let _ = self.entered.lock().send(());
                std::thread::sleep(Duration::from_millis(150));
                self.finished.store(true, Ordering::SeqCst);
            }
        }

        let stream = MockStream::new("MOCK0");
        let port = Arc::new(open(&stream));
        let (tx, rx) = mpsc::channel();
        let slow = Arc::new(SlowInput {
            entered: Mutex::new(tx),
            finished: AtomicBool::new(false),
        });
        port.set_input_listener(Some(slow.clone()));

        stream.push_incoming(b"$GPRMC");
        rx.recv_timeout(Duration::from_secs(2)).unwrap();

        let first = {
            let port = port.clone();
            std::thread::spawn(move || port.close())
        };
        while !port.inner.teardown.is_shutdown() {
            std::thread::yield_now();
        }
        port.close();
        assert!(slow.finished.load(Ordering::SeqCst));
        first.join().unwrap();
    }

    #[test]
    fn test_concurrent_close() {
        let stream = MockStream::new("MOCK0");
        let port = Arc::new(open(&stream));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let port = port.clone();
                std::thread::spawn(move || port.close())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(port.state(), HealthState::Failed);
    }
}
