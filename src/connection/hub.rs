//! One shared link, many consumers.
//!
//! A [`ConnectionHub`] wires an agent per factory into a [`FactoryArbiter`]
//! and a [`ConnectionMultiplexer`]. Agents run only while someone listens.

use super::agent::{AgentOptions, AgentPhase, ConnectionAgent};
use super::error::LinkError;
use super::link::{ConnectionFactory, LinkListener};
use super::multiplexer::{ConnectionMultiplexer, FactoryArbiter};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

pub struct ConnectionHub {
    multiplexer: Arc<ConnectionMultiplexer>,
    agents: Vec<ConnectionAgent>,
    /// Whether the agents are currently enabled.
    demand: Mutex<bool>,
}

impl ConnectionHub {
    /// Start one (disabled) agent per factory.
    ///
    /// Factories earlier in the list do not take priority; whichever link
    /// comes up first is used.
    pub fn new(
        factories: Vec<Arc<dyn ConnectionFactory>>,
        options: AgentOptions,
    ) -> Result<Arc<Self>, LinkError> {
        let multiplexer = Arc::new(ConnectionMultiplexer::new());
        let arbiter: Arc<dyn LinkListener> = Arc::new(FactoryArbiter::new(multiplexer.clone()));

        let agents = factories
            .into_iter()
            .map(|factory| ConnectionAgent::spawn(factory, arbiter.clone(), options))
            .collect::<Result<Vec<_>, _>>()?;
        info!("connection hub started with {} agent(s)", agents.len());

        Ok(Arc::new(Self {
            multiplexer,
            agents,
            demand: Mutex::new(false),
        }))
    }

    /// Register a consumer. The first one enables the agents.
    pub fn add_listener(&self, listener: Arc<dyn LinkListener>) {
        self.multiplexer.add_listener(listener);
        self.update_demand();
    }

    /// Unregister a consumer. The last one disables the agents.
    pub fn remove_listener(&self, listener: &Arc<dyn LinkListener>) -> bool {
        let removed = self.multiplexer.remove_listener(listener);
        self.update_demand();
        removed
    }

    /// Make one consumer reopen its resources on the current link.
    pub fn cycle_listener(&self, listener: &Arc<dyn LinkListener>) {
        self.multiplexer.cycle_listener(listener);
    }

    pub fn wake_up(&self) {
        for agent in &self.agents {
            agent.wake_up();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.multiplexer.is_connected()
    }

    pub fn listener_count(&self) -> usize {
        self.multiplexer.listener_count()
    }

    pub fn agents(&self) -> &[ConnectionAgent] {
        &self.agents
    }

    /// `(factory name, phase)` for each agent.
    pub fn phases(&self) -> Vec<(String, AgentPhase)> {
        self.agents
            .iter()
            .map(|agent| (agent.name().to_string(), agent.phase()))
            .collect()
    }

    /// Shut every agent down, disconnecting all consumers.
    pub fn shutdown(&self) {
        for agent in &self.agents {
            agent.shutdown();
        }
    }

    fn update_demand(&self) {
        let mut enabled = self.demand.lock();
        let wanted = !self.multiplexer.is_empty();
        if *enabled == wanted {
            return;
        }
        *enabled = wanted;
        debug!(
            "connection hub {}",
            if wanted { "enabling agents" } else { "disabling agents" }
        );
        for agent in &self.agents {
            if wanted {
                agent.enable();
            } else {
                agent.disable();
            }
        }
    }
}

impl Drop for ConnectionHub {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ConnectionHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHub")
            .field("agents", &self.agents)
            .field("listeners", &self.listener_count())
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::mock::{MockFactory, RecordingListener};
    use std::thread;
    use std::time::{Duration, Instant};

    const WAIT: Duration = Duration::from_secs(2);

    fn fast() -> AgentOptions {
        AgentOptions {
            retry_base: Duration::from_millis(10),
            retry_max: Duration::from_millis(40),
            poll_interval: Duration::from_millis(20),
        }
    }

    fn eventually(mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_first_listener_enables_agents() {
        let factory = MockFactory::new("ioio");
        let hub = ConnectionHub::new(vec![factory.clone()], fast()).unwrap();
        assert!(!hub.agents()[0].is_enabled());

        let listener = RecordingListener::new();
        hub.add_listener(listener.clone());
        assert!(listener.wait_for_events(1, WAIT));
        assert!(hub.is_connected());
        hub.shutdown();
    }

    #[test]
    fn test_last_listener_disables_agents() {
        let factory = MockFactory::new("ioio");
        let hub = ConnectionHub::new(vec![factory.clone()], fast()).unwrap();

        let first = RecordingListener::new();
        let second = RecordingListener::new();
        let first_dyn: Arc<dyn LinkListener> = first.clone();
        let second_dyn: Arc<dyn LinkListener> = second.clone();
        hub.add_listener(first_dyn.clone());
        hub.add_listener(second_dyn.clone());
        assert!(first.wait_for_events(1, WAIT));
        assert!(second.wait_for_events(1, WAIT));

        hub.remove_listener(&first_dyn);
        assert!(hub.agents()[0].is_enabled());

        hub.remove_listener(&second_dyn);
        assert!(!hub.agents()[0].is_enabled());
        assert!(eventually(|| hub.phases()[0].1 == AgentPhase::Disabled));
        assert!(eventually(|| factory
            .last_connection()
            .is_some_and(|c| c.is_disconnected())));
        hub.shutdown();
    }

    #[test]
    fn test_second_factory_is_standby() {
        let usb = MockFactory::new("usb");
        let bluetooth = MockFactory::new("bluetooth");
        bluetooth.hold();
        let hub = ConnectionHub::new(vec![usb.clone(), bluetooth.clone()], fast()).unwrap();

        let listener = RecordingListener::new();
        hub.add_listener(listener.clone());
        assert!(listener.wait_for_events(1, WAIT));
        bluetooth.release();
        assert!(eventually(|| bluetooth.connections().len() == 1));

        thread::sleep(Duration::from_millis(50));
        assert_eq!(listener.connects(), 1);
        hub.shutdown();
    }

    #[test]
    fn test_shutdown_disconnects_listeners() {
        let factory = MockFactory::new("ioio");
        let hub = ConnectionHub::new(vec![factory], fast()).unwrap();
        let listener = RecordingListener::new();
        hub.add_listener(listener.clone());
        assert!(listener.wait_for_events(1, WAIT));

        hub.shutdown();
        assert_eq!(listener.events().len(), 2);
        assert!(!hub.is_connected());
    }
}
