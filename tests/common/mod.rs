//! Shared test utilities for flightlink integration tests.
//!
//! This module provides common test infrastructure including:
//! - Polling helpers for state reached on worker threads
//! - Listeners that record what a port reports
//! - Agent options with short retry delays

#![allow(dead_code)]

use flightlink::connection::AgentOptions;
use flightlink::port::{HealthState, InputListener, Port, PortListener};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Default bound for anything that happens on a worker thread.
pub const TIMEOUT: Duration = Duration::from_secs(3);

/// Poll `condition` until it holds or `TIMEOUT` elapses.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

/// Wait until `port` reports `state`.
pub fn wait_for_state(port: &dyn Port, state: HealthState) -> bool {
    wait_until(|| port.state() == state)
}

/// Agent options that retry quickly.
pub fn fast_agent() -> AgentOptions {
    AgentOptions {
        retry_base: Duration::from_millis(10),
        retry_max: Duration::from_millis(50),
        poll_interval: Duration::from_millis(20),
    }
}

/// Collects every byte delivered to it.
#[derive(Default)]
pub struct Collector {
    data: Mutex<Vec<u8>>,
}

impl Collector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn data(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }
}

impl InputListener for Collector {
    fn on_data_received(&self, data: &[u8]) {
        self.data.lock().extend_from_slice(data);
    }
}

/// Records state-change notifications and error messages.
#[derive(Default)]
pub struct StateLog {
    changes: Mutex<usize>,
    errors: Mutex<Vec<String>>,
}

impl StateLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn changes(&self) -> usize {
        *self.changes.lock()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }
}

impl PortListener for StateLog {
    fn on_state_changed(&self) {
        *self.changes.lock() += 1;
    }

    fn on_error(&self, message: &str) {
        self.errors.lock().push(message.to_string());
    }
}
