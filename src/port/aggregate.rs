//! Fan-out port composed of independent member ports.
//!
//! Writes go to every member, input from any member reaches the single
//! aggregate input listener, and a failed member is evicted without
//! disturbing the others.

use super::error::PortError;
use super::state::{HealthState, InputListener, ListenerSlot, PortListener};
use super::teardown::SafeTeardown;
use super::traits::Port;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

fn same_port(a: &Arc<dyn Port>, b: &Arc<dyn Port>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

struct Shared {
    state: ListenerSlot<dyn PortListener>,
    input: ListenerSlot<dyn InputListener>,
    teardown: SafeTeardown,
}

/// Installed on every member; relays to whatever the aggregate has now.
///
/// Relays are admitted through the aggregate's teardown, so nothing reaches
/// the aggregate's listeners once its `close()` has waited them out.
struct Forwarder(Arc<Shared>);

impl PortListener for Forwarder {
    fn on_state_changed(&self) {
        let Some(_guard) = self.0.teardown.enter() else {
            return;
        };
        if let Some(listener) = self.0.state.get() {
            listener.on_state_changed();
        }
    }

    fn on_error(&self, message: &str) {
        let Some(_guard) = self.0.teardown.enter() else {
            return;
        };
        if let Some(listener) = self.0.state.get() {
            listener.on_error(message);
        }
    }
}

impl InputListener for Forwarder {
    fn on_data_received(&self, data: &[u8]) {
        let Some(_guard) = self.0.teardown.enter() else {
            return;
        };
        if let Some(listener) = self.0.input.get() {
            listener.on_data_received(data);
        }
    }
}

#[derive(Default)]
struct Members {
    ports: Vec<Arc<dyn Port>>,
    /// A member was evicted since the last one was added.
    recent_failure: bool,
}

/// One logical port over N member ports.
pub struct AggregatingPort {
    name: String,
    members: Mutex<Members>,
    shared: Arc<Shared>,
    forwarder: Arc<Forwarder>,
}

impl AggregatingPort {
    pub fn new(name: impl Into<String>) -> Self {
        let shared = Arc::new(Shared {
            state: ListenerSlot::new(),
            input: ListenerSlot::new(),
            teardown: SafeTeardown::new(),
        });
        Self {
            name: name.into(),
            members: Mutex::new(Members::default()),
            forwarder: Arc::new(Forwarder(shared.clone())),
            shared,
        }
    }

    /// Adopt `port` as a member. After close, the port is closed instead.
    pub fn add_member(&self, port: Arc<dyn Port>) {
        let Some(_guard) = self.shared.teardown.enter() else {
            port.close();
            return;
        };

        port.set_listener(Some(self.forwarder.clone()));
        port.set_input_listener(Some(self.forwarder.clone()));
        {
            let mut members = self.members.lock();
            members.ports.push(port);
            members.recent_failure = false;
            debug!("{}: {} member(s)", self.name, members.ports.len());
        }
        self.notify_changed();
    }

    pub fn member_count(&self) -> usize {
        self.members.lock().ports.len()
    }

    fn notify_changed(&self) {
        if let Some(listener) = self.shared.state.get() {
            listener.on_state_changed();
        }
    }

    fn evict(&self, failed: Vec<Arc<dyn Port>>) {
        if failed.is_empty() {
            return;
        }
        {
            let mut members = self.members.lock();
            members
                .ports
                .retain(|port| !failed.iter().any(|f| same_port(f, port)));
            members.recent_failure = true;
        }
        for port in &failed {
            port.close();
        }
        info!("{}: evicted {} failed member(s)", self.name, failed.len());
        self.notify_changed();
    }

    fn snapshot(&self) -> Vec<Arc<dyn Port>> {
        self.members.lock().ports.clone()
    }
}

impl Port for AggregatingPort {
    fn state(&self) -> HealthState {
        if self.shared.teardown.is_shutdown() {
            return HealthState::Failed;
        }

        let members = self.members.lock();
        let mut any_limbo = false;
        let mut any_failed = members.recent_failure;
        for port in &members.ports {
            match port.state() {
                HealthState::Ready => return HealthState::Ready,
                HealthState::Limbo => any_limbo = true,
                HealthState::Failed => any_failed = true,
            }
        }

        if any_limbo || !any_failed {
            HealthState::Limbo
        } else {
            HealthState::Failed
        }
    }

    fn set_listener(&self, listener: Option<Arc<dyn PortListener>>) {
        self.shared.state.set(listener);
    }

    fn set_input_listener(&self, listener: Option<Arc<dyn InputListener>>) {
        self.shared.input.set(listener);
    }

    /// Returns the largest count any member accepted.
    fn write(&self, data: &[u8]) -> Result<usize, PortError> {
        let Some(_guard) = self.shared.teardown.enter() else {
            return Err(PortError::NotOpen);
        };

        let mut best: Option<usize> = None;
        let mut failed = Vec::new();
        for port in self.snapshot() {
            if port.state() == HealthState::Failed {
                failed.push(port);
                continue;
            }
            match port.write(data) {
                Ok(n) => best = Some(best.map_or(n, |b| b.max(n))),
                Err(e) => {
                    if port.state() == HealthState::Failed {
                        failed.push(port);
                    } else {
                        debug!("{}: member skipped write: {}", self.name, e);
                    }
                }
            }
        }
        self.evict(failed);

        best.ok_or(PortError::NotConnected)
    }

    fn drain(&self) -> Result<(), PortError> {
        let mut result = Ok(());
        for port in self.snapshot() {
            if port.state() == HealthState::Failed {
                continue;
            }
            if let Err(e) = port.drain() {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    fn close(&self) {
        if !self.shared.teardown.begin_shutdown() {
            self.shared.teardown.wait_closed();
            return;
        }
        self.shared.teardown.finish_shutdown();

        self.shared.state.clear();
        self.shared.input.clear();
        let ports = std::mem::take(&mut self.members.lock().ports);
        for port in ports {
            port.close();
        }
        self.shared.teardown.mark_closed();
        info!("{} closed", self.name);
    }
}

impl Drop for AggregatingPort {
    fn drop(&mut self) {
        self.close();
    }
}
