//! Health model and listener plumbing shared by every port and sensor.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Three-value status of a port or sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// Usable now.
    Ready,
    /// The transport exists but is setting up or reconnecting.
    Limbo,
    /// Permanently broken; discard and recreate.
    Failed,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::Limbo => write!(f, "limbo"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Receives state transitions and error messages from a port.
///
/// Called synchronously on whichever thread caused the transition; must not
/// block.
#[cfg_attr(test, mockall::automock)]
pub trait PortListener: Send + Sync {
    /// The port's [`HealthState`] may have changed.
    fn on_state_changed(&self);

    /// A human-readable description of a failure.
    fn on_error(&self, message: &str);
}

/// Receives bytes read from a port.
#[cfg_attr(test, mockall::automock)]
pub trait InputListener: Send + Sync {
    fn on_data_received(&self, data: &[u8]);
}

/// Single replaceable listener slot.
///
/// Setting a new listener simply stops calls to the old one.
pub struct ListenerSlot<T: ?Sized> {
    inner: RwLock<Option<Arc<T>>>,
}

impl<T: ?Sized> ListenerSlot<T> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(None),
        }
    }

    /// Replace the current listener, returning the previous one.
    pub fn set(&self, listener: Option<Arc<T>>) -> Option<Arc<T>> {
        std::mem::replace(&mut *self.inner.write(), listener)
    }

    /// Snapshot of the current listener.
    pub fn get(&self) -> Option<Arc<T>> {
        self.inner.read().clone()
    }

    pub fn clear(&self) {
        self.inner.write().take();
    }
}

impl<T: ?Sized> Default for ListenerSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> fmt::Debug for ListenerSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSlot")
            .field("occupied", &self.inner.read().is_some())
            .finish()
    }
}

/// A [`HealthState`] cell paired with the state listener that observes it.
///
/// Used by ports that own their state directly (as opposed to computing it
/// from members).
#[derive(Debug)]
pub struct StateCell {
    state: Mutex<HealthState>,
    listener: ListenerSlot<dyn PortListener>,
}

impl StateCell {
    pub fn new(initial: HealthState) -> Self {
        Self {
            state: Mutex::new(initial),
            listener: ListenerSlot::new(),
        }
    }

    pub fn get(&self) -> HealthState {
        *self.state.lock()
    }

    pub fn listener(&self) -> &ListenerSlot<dyn PortListener> {
        &self.listener
    }

    /// Move to `next` and notify the listener if the value changed.
    ///
    /// `Failed` is terminal: once reached, later transitions are ignored.
    /// Returns whether a transition happened.
    pub fn transition(&self, next: HealthState) -> bool {
        {
            let mut state = self.state.lock();
            if *state == next || *state == HealthState::Failed {
                return false;
            }
            *state = next;
        }
        self.notify_changed();
        true
    }

    /// Report `message` to the listener, then move to `next`.
    pub fn fail_with(&self, next: HealthState, message: &str) {
        if let Some(listener) = self.listener.get() {
            listener.on_error(message);
        }
        self.transition(next);
    }

    pub fn notify_changed(&self) {
        if let Some(listener) = self.listener.get() {
            listener.on_state_changed();
        }
    }
}
