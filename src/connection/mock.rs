//! Mock link factory and connection for testing.
//!
//! `MockFactory` hands out `MockConnection`s whose channels are
//! [`MockStream`]s. Tests can make attempts fail, hold an attempt open until
//! it is cancelled, and drop a live link. `RecordingListener` captures the
//! connect/disconnect sequence a listener sees.

use super::agent::LinkNotifier;
use super::cancel::CancelToken;
use super::error::LinkError;
use super::link::{Connection, ConnectionFactory, LinkListener};
use crate::port::{LineControl, MockStream, PortError, StreamPair};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A mock shared link.
pub struct MockConnection {
    name: String,
    notifier: LinkNotifier,
    fail_reset: bool,
    alive: AtomicBool,
    disconnected: AtomicBool,
    resets: AtomicUsize,
    channels: Mutex<Vec<(u32, u32, MockStream)>>,
}

impl MockConnection {
    pub fn new(name: impl Into<String>, notifier: LinkNotifier) -> Self {
        Self {
            name: name.into(),
            notifier,
            fail_reset: false,
            alive: AtomicBool::new(true),
            disconnected: AtomicBool::new(false),
            resets: AtomicUsize::new(0),
            channels: Mutex::new(Vec::new()),
        }
    }

    /// Simulate the link dropping underneath its consumers.
    pub fn drop_link(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.notifier.link_failed();
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    /// `(channel, baud_rate)` of every channel opened, in order.
    pub fn opened_channels(&self) -> Vec<(u32, u32)> {
        self.channels
            .lock()
            .iter()
            .map(|(channel, baud, _)| (*channel, *baud))
            .collect()
    }

    /// The stream behind the most recent open of `channel`.
    pub fn channel(&self, channel: u32) -> Option<MockStream> {
        self.channels
            .lock()
            .iter()
            .rev()
            .find(|(c, _, _)| *c == channel)
            .map(|(_, _, stream)| stream.clone())
    }
}

impl Connection for MockConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn soft_reset(&self) -> Result<(), LinkError> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        if self.fail_reset {
            return Err(LinkError::reset("no response to soft reset"));
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.is_disconnected()
    }

    fn open_channel(&self, channel: u32, baud_rate: u32) -> Result<StreamPair, PortError> {
        if !self.is_alive() {
            return Err(PortError::NotConnected);
        }
        let stream = MockStream::new(format!("{}/{}", self.name, channel));
        stream.control().set_baud_rate(baud_rate)?;
        self.channels.lock().push((channel, baud_rate, stream.clone()));
        Ok(StreamPair::new(
            Box::new(stream.source()),
            Box::new(stream.sink()),
        ))
    }

    fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
        for (_, _, stream) in self.channels.lock().iter() {
            stream.hang_up();
        }
    }
}

#[derive(Default)]
struct FactoryState {
    hold: bool,
    fail_next: usize,
    fail_reset_next: usize,
    attempts: usize,
    cancelled: usize,
    connections: Vec<Arc<MockConnection>>,
}

#[derive(Default)]
struct FactoryInner {
    state: Mutex<FactoryState>,
    changed: Condvar,
}

/// A mock [`ConnectionFactory`].
pub struct MockFactory {
    name: String,
    inner: Arc<FactoryInner>,
}

impl MockFactory {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            inner: Arc::new(FactoryInner::default()),
        })
    }

    /// Block further attempts until released or cancelled.
    pub fn hold(&self) {
        self.inner.state.lock().hold = true;
    }

    pub fn release(&self) {
        self.inner.state.lock().hold = false;
        self.inner.changed.notify_all();
    }

    /// Refuse the next `count` attempts.
    pub fn fail_next(&self, count: usize) {
        self.inner.state.lock().fail_next = count;
    }

    /// Make the reset handshake fail on the next `count` connections.
    pub fn fail_reset_next(&self, count: usize) {
        self.inner.state.lock().fail_reset_next = count;
    }

    pub fn attempts(&self) -> usize {
        self.inner.state.lock().attempts
    }

    /// Attempts that ended because their token was cancelled.
    pub fn cancelled(&self) -> usize {
        self.inner.state.lock().cancelled
    }

    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        self.inner.state.lock().connections.clone()
    }

    pub fn last_connection(&self) -> Option<Arc<MockConnection>> {
        self.inner.state.lock().connections.last().cloned()
    }

    /// Wait until at least `count` attempts have started.
    pub fn wait_for_attempts(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while state.attempts < count {
            if self.inner.changed.wait_until(&mut state, deadline).timed_out() {
                return state.attempts >= count;
            }
        }
        true
    }
}

impl ConnectionFactory for MockFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(
        &self,
        cancel: &CancelToken,
        notifier: LinkNotifier,
    ) -> Result<Arc<dyn Connection>, LinkError> {
        let inner = self.inner.clone();
        cancel.on_cancel(move || {
            let _state = inner.state.lock();
            inner.changed.notify_all();
        });

        let mut state = self.inner.state.lock();
        state.attempts += 1;
        self.inner.changed.notify_all();

        while state.hold && !cancel.is_cancelled() {
            self.inner.changed.wait(&mut state);
        }
        if cancel.is_cancelled() {
            state.cancelled += 1;
            return Err(LinkError::Cancelled);
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(LinkError::open("mock link refused"));
        }

        let mut connection = MockConnection::new(
            format!("{}#{}", self.name, state.attempts),
            notifier,
        );
        if state.fail_reset_next > 0 {
            state.fail_reset_next -= 1;
            connection.fail_reset = true;
        }
        let connection = Arc::new(connection);
        state.connections.push(connection.clone());
        Ok(connection)
    }
}

/// One event observed by a [`RecordingListener`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected(String),
    Disconnected(String),
}

/// A [`LinkListener`] that records what it is told.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<LinkEvent>>,
    alive_at_disconnect: Mutex<Vec<bool>>,
    changed: Condvar,
    idle: AtomicUsize,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<LinkEvent> {
        self.events.lock().clone()
    }

    pub fn connects(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, LinkEvent::Connected(_)))
            .count()
    }

    /// Whether the link was still up when each disconnect was delivered.
    pub fn alive_at_disconnect(&self) -> Vec<bool> {
        self.alive_at_disconnect.lock().clone()
    }

    pub fn idle_calls(&self) -> usize {
        self.idle.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` events have been recorded.
    pub fn wait_for_events(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut events = self.events.lock();
        while events.len() < count {
            if self.changed.wait_until(&mut events, deadline).timed_out() {
                return events.len() >= count;
            }
        }
        true
    }

    fn record(&self, event: LinkEvent) {
        self.events.lock().push(event);
        self.changed.notify_all();
    }
}

impl LinkListener for RecordingListener {
    fn on_connect(&self, connection: &Arc<dyn Connection>) {
        self.record(LinkEvent::Connected(connection.name().to_string()));
    }

    fn on_disconnect(&self, connection: &Arc<dyn Connection>) {
        self.alive_at_disconnect.lock().push(connection.is_alive());
        self.record(LinkEvent::Disconnected(connection.name().to_string()));
    }

    fn on_idle(&self, _connection: Option<&Arc<dyn Connection>>) {
        self.idle.fetch_add(1, Ordering::SeqCst);
    }
}
