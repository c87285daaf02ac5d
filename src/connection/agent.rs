//! Background worker that keeps one shared link open while it is wanted.
//!
//! Each [`ConnectionAgent`] owns one [`ConnectionFactory`] and one
//! [`LinkListener`]. While enabled it opens the link, runs the reset
//! handshake and reports the connection; when the link drops, or the agent is
//! disabled, it reports the disconnect and tears the link down. Failed
//! attempts are retried with exponential backoff.

use super::backoff::Backoff;
use super::cancel::CancelToken;
use super::error::LinkError;
use super::link::{Connection, ConnectionFactory, LinkListener};
use crate::config::AgentConfig;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// What the agent is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    Disabled,
    Disconnected,
    Connecting,
    Connected,
    ShutDown,
}

/// Timing knobs for a [`ConnectionAgent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentOptions {
    /// Delay after the first failed attempt.
    pub retry_base: Duration,
    /// Upper bound for the retry delay.
    pub retry_max: Duration,
    /// How often a quiet connection is re-checked with `is_alive`.
    pub poll_interval: Duration,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            retry_base: Duration::from_millis(500),
            retry_max: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl From<&AgentConfig> for AgentOptions {
    fn from(config: &AgentConfig) -> Self {
        Self {
            retry_base: config.retry_base(),
            retry_max: config.retry_max(),
            poll_interval: config.poll_interval(),
        }
    }
}

struct AgentState {
    enabled: bool,
    shutdown: bool,
    wake: bool,
    link_failed: bool,
    /// Bumped for every attempt; stale notifiers compare against it.
    generation: u64,
    attempt: Option<CancelToken>,
    phase: AgentPhase,
}

impl AgentState {
    fn settle(&mut self) {
        self.phase = if self.enabled {
            AgentPhase::Disconnected
        } else {
            AgentPhase::Disabled
        };
    }
}

struct AgentShared {
    name: String,
    factory: Arc<dyn ConnectionFactory>,
    listener: Arc<dyn LinkListener>,
    options: AgentOptions,
    state: Mutex<AgentState>,
    changed: Condvar,
}

/// Lets a connection report that its link dropped.
///
/// Each attempt gets its own notifier; once the agent has moved on to a newer
/// attempt, calls through an old notifier are ignored.
#[derive(Clone)]
pub struct LinkNotifier {
    shared: Weak<AgentShared>,
    generation: u64,
}

impl LinkNotifier {
    /// A notifier not attached to any agent. Calls are ignored.
    pub fn detached() -> Self {
        Self {
            shared: Weak::new(),
            generation: 0,
        }
    }

    /// Wake the agent and make it tear the link down.
    pub fn link_failed(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut state = shared.state.lock();
        if state.generation != self.generation {
            debug!(
                "agent {}: ignoring failure from stale link #{}",
                shared.name, self.generation
            );
            return;
        }
        state.link_failed = true;
        shared.changed.notify_all();
    }
}

impl std::fmt::Debug for LinkNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkNotifier")
            .field("generation", &self.generation)
            .field("attached", &(self.shared.strong_count() > 0))
            .finish()
    }
}

enum Step {
    Open(CancelToken, LinkNotifier),
    Close,
    Wait,
    Exit,
}

/// Keeps one link open on behalf of its listener.
pub struct ConnectionAgent {
    shared: Arc<AgentShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl ConnectionAgent {
    /// Start a disabled agent for `factory`.
    pub fn spawn(
        factory: Arc<dyn ConnectionFactory>,
        listener: Arc<dyn LinkListener>,
        options: AgentOptions,
    ) -> Result<Self, LinkError> {
        let name = factory.name().to_string();
        let shared = Arc::new(AgentShared {
            name: name.clone(),
            factory,
            listener,
            options,
            state: Mutex::new(AgentState {
                enabled: false,
                shutdown: false,
                wake: false,
                link_failed: false,
                generation: 0,
                attempt: None,
                phase: AgentPhase::Disabled,
            }),
            changed: Condvar::new(),
        });

        let worker = {
            let shared = shared.clone();
            thread::Builder::new()
                .name(format!("agent:{name}"))
                .spawn(move || run(&shared))?
        };
        let worker_id = worker.thread().id();

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
            worker_id,
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn phase(&self) -> AgentPhase {
        self.shared.state.lock().phase
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.state.lock().enabled
    }

    /// Start keeping the link open.
    pub fn enable(&self) {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return;
        }
        if !state.enabled {
            debug!("agent {} enabled", self.shared.name);
            state.enabled = true;
        }
        if state.attempt.is_none() {
            state.wake = true;
            self.shared.changed.notify_all();
        }
    }

    /// Stop keeping the link open. Cancels an attempt in progress and closes
    /// an open connection.
    pub fn disable(&self) {
        let attempt = {
            let mut state = self.shared.state.lock();
            if state.enabled {
                debug!("agent {} disabled", self.shared.name);
            }
            state.enabled = false;
            state.wake = true;
            self.shared.changed.notify_all();
            state.attempt.clone()
        };
        if let Some(token) = attempt {
            token.cancel();
        }
    }

    /// Make the worker re-evaluate its state now.
    pub fn wake_up(&self) {
        let mut state = self.shared.state.lock();
        state.wake = true;
        self.shared.changed.notify_all();
    }

    /// Close the link and stop the worker.
    ///
    /// Blocks until the worker has exited, except when called from the
    /// worker itself (e.g. from a listener callback).
    pub fn shutdown(&self) {
        let attempt = {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.enabled = false;
            state.wake = true;
            self.shared.changed.notify_all();
            state.attempt.clone()
        };
        if let Some(token) = attempt {
            token.cancel();
        }

        if thread::current().id() == self.worker_id {
            return;
        }
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!("agent {}: worker panicked", self.shared.name);
            }
        }
    }
}

impl Drop for ConnectionAgent {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ConnectionAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionAgent")
            .field("name", &self.shared.name)
            .field("phase", &self.phase())
            .finish()
    }
}

fn run(shared: &Arc<AgentShared>) {
    let mut connection: Option<Arc<dyn Connection>> = None;
    let mut backoff = Backoff::new(shared.options.retry_base, shared.options.retry_max);
    let mut retry_at: Option<Instant> = None;

    loop {
        match next_step(shared, connection.as_ref(), &mut retry_at, &mut backoff) {
            Step::Exit => break,
            Step::Wait => {}
            Step::Close => {
                if let Some(conn) = connection.take() {
                    close_connection(shared, &conn);
                }
            }
            Step::Open(token, notifier) => {
                connection = attempt(shared, &token, notifier, &mut retry_at, &mut backoff);
            }
        }
        shared.listener.on_idle(connection.as_ref());
        wait(shared, connection.as_ref(), retry_at);
    }

    shared.state.lock().phase = AgentPhase::ShutDown;
    debug!("agent {} worker exited", shared.name);
}

fn next_step(
    shared: &Arc<AgentShared>,
    connection: Option<&Arc<dyn Connection>>,
    retry_at: &mut Option<Instant>,
    backoff: &mut Backoff,
) -> Step {
    let mut state = shared.state.lock();
    state.wake = false;

    if let Some(conn) = connection {
        if state.shutdown || !state.enabled || state.link_failed || !conn.is_alive() {
            return Step::Close;
        }
        return Step::Wait;
    }

    if state.shutdown {
        return Step::Exit;
    }
    if !state.enabled {
        *retry_at = None;
        backoff.reset();
        state.settle();
        return Step::Wait;
    }
    if retry_at.is_some_and(|at| Instant::now() < at) {
        state.settle();
        return Step::Wait;
    }

    state.generation += 1;
    state.link_failed = false;
    state.phase = AgentPhase::Connecting;
    let token = CancelToken::new();
    state.attempt = Some(token.clone());
    let notifier = LinkNotifier {
        shared: Arc::downgrade(shared),
        generation: state.generation,
    };
    Step::Open(token, notifier)
}

fn attempt(
    shared: &AgentShared,
    token: &CancelToken,
    notifier: LinkNotifier,
    retry_at: &mut Option<Instant>,
    backoff: &mut Backoff,
) -> Option<Arc<dyn Connection>> {
    debug!("agent {}: connecting", shared.name);
    let result = shared
        .factory
        .open(token, notifier)
        .and_then(|conn| match conn.soft_reset() {
            Ok(()) => Ok(conn),
            Err(e) => {
                conn.disconnect();
                Err(e)
            }
        });

    let mut state = shared.state.lock();
    state.attempt = None;
    let aborted = token.is_cancelled() || state.shutdown || !state.enabled;

    match result {
        Ok(conn) if aborted => {
            state.settle();
            drop(state);
            debug!(
                "agent {}: attempt abandoned, dropping {}",
                shared.name,
                conn.name()
            );
            conn.disconnect();
            None
        }
        Ok(conn) => {
            backoff.reset();
            *retry_at = None;
            state.phase = AgentPhase::Connected;
            drop(state);
            info!("agent {}: connected to {}", shared.name, conn.name());
            shared.listener.on_connect(&conn);
            Some(conn)
        }
        Err(e) if aborted || matches!(e, LinkError::Cancelled) => {
            state.settle();
            debug!("agent {}: attempt cancelled ({})", shared.name, e);
            None
        }
        Err(e) => {
            state.settle();
            drop(state);
            let delay = backoff.next_delay();
            warn!("agent {}: {} (retry in {:?})", shared.name, e, delay);
            *retry_at = Some(Instant::now() + delay);
            None
        }
    }
}

fn close_connection(shared: &AgentShared, conn: &Arc<dyn Connection>) {
    info!("agent {}: closing {}", shared.name, conn.name());
    shared.listener.on_disconnect(conn);
    conn.disconnect();

    let mut state = shared.state.lock();
    state.link_failed = false;
    state.settle();
}

fn wait(shared: &AgentShared, connection: Option<&Arc<dyn Connection>>, retry_at: Option<Instant>) {
    let mut state = shared.state.lock();
    loop {
        if state.wake || state.shutdown || state.link_failed {
            return;
        }
        match connection {
            Some(conn) => {
                if !state.enabled || !conn.is_alive() {
                    return;
                }
                if shared
                    .changed
                    .wait_for(&mut state, shared.options.poll_interval)
                    .timed_out()
                {
                    return;
                }
            }
            None if !state.enabled => shared.changed.wait(&mut state),
            None => match retry_at {
                Some(at) if Instant::now() < at => {
                    shared.changed.wait_until(&mut state, at);
                }
                _ => return,
            },
        }
    }
}
