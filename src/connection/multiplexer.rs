//! Fan-out of one shared link to many consumers.
//!
//! [`ConnectionMultiplexer`] tracks which listeners believe the link is up
//! and replays connect/disconnect events so each listener sees a strictly
//! alternating sequence, no matter when it joins or leaves.
//! [`FactoryArbiter`] sits one level above: several agents report into it
//! and only one of their connections is forwarded at a time.

use super::link::{same_object, Connection, LinkListener};
use parking_lot::{Mutex, ReentrantMutex};
use std::sync::Arc;
use tracing::debug;

#[derive(Default)]
struct MuxState {
    connection: Option<Arc<dyn Connection>>,
    connected: Vec<Arc<dyn LinkListener>>,
    disconnected: Vec<Arc<dyn LinkListener>>,
}

fn position(list: &[Arc<dyn LinkListener>], listener: &Arc<dyn LinkListener>) -> Option<usize> {
    list.iter().position(|l| same_object(l, listener))
}

/// Distributes one link's connect/disconnect events.
///
/// All notifications go through one re-entrant dispatch lock, so a listener
/// may add, remove or cycle listeners from inside its own callback.
#[derive(Default)]
pub struct ConnectionMultiplexer {
    dispatch: ReentrantMutex<()>,
    state: Mutex<MuxState>,
}

impl ConnectionMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener`. It is told about a live link right away.
    pub fn add_listener(&self, listener: Arc<dyn LinkListener>) {
        let _dispatch = self.dispatch.lock();
        let connection = {
            let mut state = self.state.lock();
            if position(&state.connected, &listener).is_some()
                || position(&state.disconnected, &listener).is_some()
            {
                return;
            }
            match state.connection.clone() {
                Some(conn) => {
                    state.connected.push(listener.clone());
                    conn
                }
                None => {
                    state.disconnected.push(listener);
                    return;
                }
            }
        };
        listener.on_connect(&connection);
    }

    /// Unregister `listener`, telling it the link is gone first if it
    /// believed it was up. Returns whether it was registered.
    pub fn remove_listener(&self, listener: &Arc<dyn LinkListener>) -> bool {
        let _dispatch = self.dispatch.lock();
        let connection = {
            let mut state = self.state.lock();
            if let Some(index) = position(&state.connected, listener) {
                state.connected.remove(index);
                state.connection.clone()
            } else if let Some(index) = position(&state.disconnected, listener) {
                state.disconnected.remove(index);
                return true;
            } else {
                return false;
            }
        };
        if let Some(conn) = connection {
            listener.on_disconnect(&conn);
        }
        true
    }

    /// Replay disconnect + connect to `listener` only, so it reopens its
    /// resources on the same link.
    pub fn cycle_listener(&self, listener: &Arc<dyn LinkListener>) {
        let _dispatch = self.dispatch.lock();
        let connection = {
            let mut state = self.state.lock();
            let Some(index) = position(&state.connected, listener) else {
                return;
            };
            let Some(conn) = state.connection.clone() else {
                return;
            };
            let moved = state.connected.remove(index);
            state.disconnected.push(moved);
            conn
        };
        listener.on_disconnect(&connection);

        {
            let mut state = self.state.lock();
            let still_current = state
                .connection
                .as_ref()
                .is_some_and(|c| same_object(c, &connection));
            let Some(index) = position(&state.disconnected, listener) else {
                return;
            };
            if !still_current {
                return;
            }
            let moved = state.disconnected.remove(index);
            state.connected.push(moved);
        }
        listener.on_connect(&connection);
    }

    pub fn listener_count(&self) -> usize {
        let state = self.state.lock();
        state.connected.len() + state.disconnected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listener_count() == 0
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connection.is_some()
    }

    pub fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.state.lock().connection.clone()
    }
}

impl LinkListener for ConnectionMultiplexer {
    fn on_connect(&self, connection: &Arc<dyn Connection>) {
        let _dispatch = self.dispatch.lock();
        self.state.lock().connection = Some(connection.clone());
        loop {
            let listener = {
                let mut state = self.state.lock();
                let Some(listener) = state.disconnected.pop() else {
                    break;
                };
                state.connected.push(listener.clone());
                listener
            };
            listener.on_connect(connection);
        }
    }

    fn on_disconnect(&self, connection: &Arc<dyn Connection>) {
        let _dispatch = self.dispatch.lock();
        {
            let mut state = self.state.lock();
            match &state.connection {
                Some(current) if same_object(current, connection) => state.connection = None,
                _ => return,
            }
        }
        loop {
            let listener = {
                let mut state = self.state.lock();
                let Some(listener) = state.connected.pop() else {
                    break;
                };
                state.disconnected.push(listener.clone());
                listener
            };
            listener.on_disconnect(connection);
        }
    }
}

#[derive(Default)]
struct ArbiterState {
    active: Option<Arc<dyn Connection>>,
    standby: Vec<Arc<dyn Connection>>,
}

/// Chooses one link among several agents' connections.
///
/// The first connection to arrive is forwarded; later ones wait on standby
/// and the oldest is promoted when the active one goes away.
pub struct FactoryArbiter {
    downstream: Arc<dyn LinkListener>,
    dispatch: ReentrantMutex<()>,
    state: Mutex<ArbiterState>,
}

impl FactoryArbiter {
    pub fn new(downstream: Arc<dyn LinkListener>) -> Self {
        Self {
            downstream,
            dispatch: ReentrantMutex::new(()),
            state: Mutex::new(ArbiterState::default()),
        }
    }

    pub fn active(&self) -> Option<Arc<dyn Connection>> {
        self.state.lock().active.clone()
    }

    pub fn standby_count(&self) -> usize {
        self.state.lock().standby.len()
    }
}

impl LinkListener for FactoryArbiter {
    fn on_connect(&self, connection: &Arc<dyn Connection>) {
        let _dispatch = self.dispatch.lock();
        {
            let mut state = self.state.lock();
            if state.active.is_some() {
                debug!("link {} on standby", connection.name());
                state.standby.push(connection.clone());
                return;
            }
            state.active = Some(connection.clone());
        }
        self.downstream.on_connect(connection);
    }

    fn on_disconnect(&self, connection: &Arc<dyn Connection>) {
        let _dispatch = self.dispatch.lock();
        let promoted = {
            let mut state = self.state.lock();
            let is_active = state
                .active
                .as_ref()
                .is_some_and(|active| same_object(active, connection));
            if !is_active {
                state.standby.retain(|c| !same_object(c, connection));
                return;
            }
            state.active = None;
            if state.standby.is_empty() {
                None
            } else {
                let next = state.standby.remove(0);
                state.active = Some(next.clone());
                Some(next)
            }
        };
        self.downstream.on_disconnect(connection);
        if let Some(next) = promoted {
            debug!("promoting standby link {}", next.name());
            self.downstream.on_connect(&next);
        }
    }

    fn on_idle(&self, connection: Option<&Arc<dyn Connection>>) {
        let Some(connection) = connection else {
            return;
        };
        let is_active = self
            .state
            .lock()
            .active
            .as_ref()
            .is_some_and(|active| same_object(active, connection));
        if is_active {
            self.downstream.on_idle(Some(connection));
        }
    }
}
