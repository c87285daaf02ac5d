//! Sensors attached to a shared link.
//!
//! A sensor (barometer, airspeed probe, ...) is not a byte stream; it only
//! reports health. [`LinkedSensor`] starts its [`SensorDriver`] every time the
//! hub's link comes up and stops it when the link goes away.

use super::hub::ConnectionHub;
use super::link::{Connection, LinkListener};
use crate::port::{HealthState, PortError, PortListener, SafeTeardown, StateCell};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Health contract shared by all sensors.
pub trait Sensor: Send + Sync {
    fn state(&self) -> HealthState;

    fn set_listener(&self, listener: Option<Arc<dyn PortListener>>);

    /// Stop the sensor. Idempotent; no listener is called afterwards.
    fn close(&self);
}

/// Device-specific part of a linked sensor.
pub trait SensorDriver: Send + Sync {
    /// Bring the device up on a freshly connected link.
    ///
    /// Return [`PortError::Incompatible`] when the device can never work on
    /// this link; the sensor then fails permanently.
    fn start(&self, connection: &Arc<dyn Connection>) -> Result<(), PortError>;

    /// Release whatever `start` acquired.
    fn stop(&self);
}

struct SensorInner {
    name: String,
    driver: Arc<dyn SensorDriver>,
    state: StateCell,
    running: Mutex<bool>,
    teardown: SafeTeardown,
}

impl SensorInner {
    fn stop_driver(&self) {
        let was_running = std::mem::replace(&mut *self.running.lock(), false);
        if was_running {
            debug!("sensor {}: stopping driver", self.name);
            self.driver.stop();
        }
    }
}

impl LinkListener for SensorInner {
    fn on_connect(&self, connection: &Arc<dyn Connection>) {
        let Some(_guard) = self.teardown.enter() else {
            return;
        };
        if self.state.get() == HealthState::Failed {
            return;
        }
        match self.driver.start(connection) {
            Ok(()) => {
                *self.running.lock() = true;
                info!("sensor {} running on {}", self.name, connection.name());
                self.state.transition(HealthState::Ready);
            }
            Err(e @ PortError::Incompatible(_)) => {
                warn!("sensor {}: {}", self.name, e);
                self.state.fail_with(HealthState::Failed, &e.to_string());
            }
            Err(e) => {
                warn!("sensor {}: start failed: {}", self.name, e);
                self.state.fail_with(HealthState::Limbo, &e.to_string());
            }
        }
    }

    fn on_disconnect(&self, _connection: &Arc<dyn Connection>) {
        self.stop_driver();
        let Some(_guard) = self.teardown.enter() else {
            return;
        };
        self.state.transition(HealthState::Limbo);
    }
}

/// A [`Sensor`] driven by a [`ConnectionHub`].
pub struct LinkedSensor {
    inner: Arc<SensorInner>,
    hub: Weak<ConnectionHub>,
}

impl LinkedSensor {
    pub fn attach(
        hub: &Arc<ConnectionHub>,
        name: impl Into<String>,
        driver: Arc<dyn SensorDriver>,
    ) -> Self {
        let inner = Arc::new(SensorInner {
            name: name.into(),
            driver,
            state: StateCell::new(HealthState::Limbo),
            running: Mutex::new(false),
            teardown: SafeTeardown::new(),
        });
        hub.add_listener(inner.clone());
        Self {
            inner,
            hub: Arc::downgrade(hub),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

impl Sensor for LinkedSensor {
    fn state(&self) -> HealthState {
        self.inner.state.get()
    }

    fn set_listener(&self, listener: Option<Arc<dyn PortListener>>) {
        self.inner.state.listener().set(listener);
    }

    fn close(&self) {
        if !self.inner.teardown.begin_shutdown() {
            self.inner.teardown.wait_closed();
            return;
        }
        self.inner.state.listener().clear();
        if let Some(hub) = self.hub.upgrade() {
            let listener: Arc<dyn LinkListener> = self.inner.clone();
            hub.remove_listener(&listener);
        }
        self.inner.teardown.finish_shutdown();
        self.inner.stop_driver();
        self.inner.state.transition(HealthState::Failed);
        self.inner.teardown.mark_closed();
    }
}

impl Drop for LinkedSensor {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::agent::AgentOptions;
    use crate::connection::mock::MockFactory;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct FakeDriver {
        starts: AtomicUsize,
        stops: AtomicUsize,
        incompatible: bool,
    }

    impl SensorDriver for FakeDriver {
        fn start(&self, _connection: &Arc<dyn Connection>) -> Result<(), PortError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.incompatible {
                return Err(PortError::Incompatible("BMP085 not found on TWI 0".into()));
            }
            Ok(())
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn hub(factory: &Arc<MockFactory>) -> Arc<ConnectionHub> {
        let options = AgentOptions {
            retry_base: Duration::from_millis(10),
            retry_max: Duration::from_millis(40),
            poll_interval: Duration::from_millis(20),
        };
        ConnectionHub::new(vec![factory.clone()], options).unwrap()
    }

    fn wait_state(sensor: &LinkedSensor, state: HealthState) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if sensor.state() == state {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_sensor_runs_while_linked() {
        let factory = MockFactory::new("ioio");
        let hub = hub(&factory);
        let driver = Arc::new(FakeDriver::default());
        let sensor = LinkedSensor::attach(&hub, "baro", driver.clone());
        assert!(wait_state(&sensor, HealthState::Ready));
        assert_eq!(driver.starts.load(Ordering::SeqCst), 1);

        sensor.close();
        assert_eq!(sensor.state(), HealthState::Failed);
        assert_eq!(driver.stops.load(Ordering::SeqCst), 1);
        assert_eq!(hub.listener_count(), 0);
    }

    #[test]
    fn test_incompatible_driver_fails_permanently() {
        let factory = MockFactory::new("ioio");
        factory.hold();
        let hub = hub(&factory);
        let driver = Arc::new(FakeDriver {
            incompatible: true,
            ..FakeDriver::default()
        });

        let errors = Arc::new(Mutex::new(Vec::new()));
        struct Errors(Arc<Mutex<Vec<String>>>);
        impl PortListener for Errors {
            fn on_state_changed(&self) {}
            fn on_error(&self, message: &str) {
                self.0.lock().push(message.to_string());
            }
        }

        let sensor = LinkedSensor::attach(&hub, "baro", driver.clone());
        sensor.set_listener(Some(Arc::new(Errors(errors.clone()))));
        factory.release();
        assert!(wait_state(&sensor, HealthState::Failed));
        assert_eq!(driver.stops.load(Ordering::SeqCst), 0);

        let recorded = errors.lock().clone();
        assert_eq!(recorded.len(), 1);
        assert!(recorded[0].contains("BMP085"));
        sensor.close();
    }
}
