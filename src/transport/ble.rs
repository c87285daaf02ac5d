//! BLE serial port over an HM-10 style GATT module.
//!
//! The GATT stack is abstracted behind [`GattClient`]: it starts operations,
//! and the stack reports their outcome by calling the `on_*` methods of
//! [`BlePort`] on its own thread. Setup runs as a chain of those callbacks:
//!
//! ```text
//! connected -> [request MTU] -> discover services -> enable notifications -> Ready
//! ```
//!
//! Outgoing bytes go through a [`ChunkedFlowBuffer`], one ATT operation at a
//! time, `mtu - 3` bytes per chunk.

use crate::config::BleConfig;
use crate::port::{
    ChunkedFlowBuffer, FlowConfig, GattCharacteristic, HealthState, InputListener, ListenerSlot,
    Port, PortError, PortListener, SafeTeardown, StateCell,
};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// HM-10 serial service.
pub const HM10_SERVICE: Uuid = Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb);

/// HM-10 serial characteristic, used for both directions.
pub const HM10_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);

/// Descriptor that switches notifications on.
pub const CLIENT_CHARACTERISTIC_CONFIG: Uuid =
    Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// ATT header bytes not available for payload.
const ATT_HEADER: usize = 3;

/// One service reported by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

/// GATT operations provided by the platform stack.
///
/// Every call only starts the operation. Completion arrives through the
/// matching [`BlePort`] callback.
pub trait GattClient: Send + Sync {
    fn request_mtu(&self, mtu: u16) -> Result<(), PortError>;

    fn discover_services(&self) -> Result<(), PortError>;

    /// Subscribe to notifications by writing [`CLIENT_CHARACTERISTIC_CONFIG`].
    fn enable_notifications(&self, service: Uuid, characteristic: Uuid) -> Result<(), PortError>;

    fn read_characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<(), PortError>;

    fn write_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), PortError>;

    /// Ask the peer to drop the link; confirmed by `on_connection_state(false)`.
    fn disconnect(&self) -> Result<(), PortError>;

    /// Release the client. Nothing is called on it afterwards.
    fn close(&self);
}

/// The serial characteristic as seen by the flow buffer.
struct SerialCharacteristic(Arc<dyn GattClient>);

impl GattCharacteristic for SerialCharacteristic {
    fn request_read(&self) -> Result<(), PortError> {
        self.0.read_characteristic(HM10_SERVICE, HM10_CHARACTERISTIC)
    }

    fn write_chunk(&self, chunk: &[u8]) -> Result<(), PortError> {
        self.0
            .write_characteristic(HM10_SERVICE, HM10_CHARACTERISTIC, chunk)
    }
}

/// Tuning for a [`BlePort`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BleOptions {
    pub flow: FlowConfig,
    /// MTU to ask for once connected.
    pub request_mtu: Option<u16>,
    /// Bound on the wait for the disconnect confirmation in `close`.
    pub disconnect_timeout: Duration,
}

impl Default for BleOptions {
    fn default() -> Self {
        Self::from(&BleConfig::default())
    }
}

impl From<&BleConfig> for BleOptions {
    fn from(config: &BleConfig) -> Self {
        Self {
            flow: FlowConfig {
                capacity: config.buffer_capacity,
                chunk_size: usize::from(config.default_mtu).saturating_sub(ATT_HEADER).max(1),
                write_timeout: config.write_timeout(),
                drain_timeout: config.drain_timeout(),
            },
            request_mtu: config.request_mtu,
            disconnect_timeout: config.disconnect_timeout(),
        }
    }
}

/// Port over the HM-10 serial characteristic.
pub struct BlePort {
    name: String,
    client: Arc<dyn GattClient>,
    options: BleOptions,
    flow: ChunkedFlowBuffer,
    state: StateCell,
    input: ListenerSlot<dyn InputListener>,
    teardown: SafeTeardown,
    connected: Mutex<bool>,
    link_changed: Condvar,
}

impl BlePort {
    /// Create the port for a client whose connection is under way.
    ///
    /// The port stays `Limbo` until the link is up and subscribed.
    pub fn new(
        name: impl Into<String>,
        client: Arc<dyn GattClient>,
        options: BleOptions,
    ) -> Result<Self, PortError> {
        let flow = ChunkedFlowBuffer::new(
            Arc::new(SerialCharacteristic(client.clone())),
            options.flow,
        )?;
        Ok(Self {
            name: name.into(),
            client,
            options,
            flow,
            state: StateCell::new(HealthState::Limbo),
            input: ListenerSlot::new(),
            teardown: SafeTeardown::new(),
            connected: Mutex::new(false),
            link_changed: Condvar::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bytes waiting for the link.
    pub fn pending(&self) -> usize {
        self.flow.pending()
    }

    pub fn chunk_size(&self) -> usize {
        self.flow.chunk_size()
    }

    pub fn on_connection_state(&self, connected: bool) {
        // Recorded before the guard so a closing port sees the confirmation.
        *self.connected.lock() = connected;
        self.link_changed.notify_all();

        let Some(_guard) = self.teardown.enter() else {
            return;
        };

        if connected {
            info!("{}: connected, discovering services", self.name);
            if let Some(mtu) = self.options.request_mtu {
                if let Err(e) = self.client.request_mtu(mtu) {
                    warn!("{}: MTU request failed: {}", self.name, e);
                }
            }
            if let Err(e) = self.client.discover_services() {
                self.state
                    .fail_with(HealthState::Limbo, &format!("service discovery failed: {e}"));
            }
        } else {
            info!("{}: link lost", self.name);
            if self.flow.is_busy() || self.flow.pending() > 0 {
                self.flow.on_write_failed("link lost");
            }
            self.state
                .fail_with(HealthState::Limbo, &format!("{}: link lost", self.name));
        }
    }

    pub fn on_services_discovered(&self, services: &[GattService]) {
        let Some(_guard) = self.teardown.enter() else {
            return;
        };

        let found = services
            .iter()
            .any(|s| s.uuid == HM10_SERVICE && s.characteristics.contains(&HM10_CHARACTERISTIC));
        if !found {
            self.state.fail_with(
                HealthState::Failed,
                &format!("{}: no serial characteristic {}", self.name, HM10_CHARACTERISTIC),
            );
            return;
        }

        match self
            .client
            .enable_notifications(HM10_SERVICE, HM10_CHARACTERISTIC)
        {
            Ok(()) => {
                debug!("{}: notifications enabled", self.name);
                self.state.transition(HealthState::Ready);
            }
            Err(e) => self.state.fail_with(
                HealthState::Limbo,
                &format!("{}: cannot enable notifications: {e}", self.name),
            ),
        }
    }

    pub fn on_mtu_changed(&self, mtu: u16) {
        let Some(_guard) = self.teardown.enter() else {
            return;
        };
        let chunk = usize::from(mtu).saturating_sub(ATT_HEADER);
        if chunk > 0 {
            self.flow.set_chunk_size(chunk);
        }
    }

    /// Completion of the read that primes each write chain.
    pub fn on_characteristic_read(&self, ok: bool) {
        let Some(_guard) = self.teardown.enter() else {
            return;
        };
        if ok {
            self.flow.begin_write_next_chunk();
        } else {
            self.flow.on_write_failed("characteristic read failed");
        }
    }

    pub fn on_characteristic_write(&self, ok: bool) {
        let Some(_guard) = self.teardown.enter() else {
            return;
        };
        if ok {
            self.flow.begin_write_next_chunk();
        } else {
            self.flow.on_write_failed("characteristic write rejected");
        }
    }

    /// Notification payload from the peer.
    pub fn on_characteristic_changed(&self, data: &[u8]) {
        let Some(_guard) = self.teardown.enter() else {
            return;
        };
        if let Some(listener) = self.input.get() {
            listener.on_data_received(data);
        }
    }

    fn await_disconnect(&self) {
        let deadline = Instant::now() + self.options.disconnect_timeout;
        let mut connected = self.connected.lock();
        while *connected {
            if self
                .link_changed
                .wait_until(&mut connected, deadline)
                .timed_out()
            {
                debug!("{}: no disconnect confirmation", self.name);
                return;
            }
        }
    }
}

impl Port for BlePort {
    fn state(&self) -> HealthState {
        self.state.get()
    }

    fn set_listener(&self, listener: Option<Arc<dyn PortListener>>) {
        self.state.listener().set(listener);
    }

    fn set_input_listener(&self, listener: Option<Arc<dyn InputListener>>) {
        self.input.set(listener);
    }

    fn write(&self, data: &[u8]) -> Result<usize, PortError> {
        if self.teardown.is_shutdown() {
            return Err(PortError::NotOpen);
        }
        if self.state.get() != HealthState::Ready {
            return Err(PortError::NotConnected);
        }
        self.flow.write(data)
    }

    fn drain(&self) -> Result<(), PortError> {
        self.flow.drain()
    }

    fn close(&self) {
        if !self.teardown.begin_shutdown() {
            self.teardown.wait_closed();
            return;
        }
        self.state.listener().clear();
        self.input.clear();

        if *self.connected.lock() {
            match self.client.disconnect() {
                Ok(()) => self.await_disconnect(),
                Err(e) => warn!("{}: disconnect failed: {}", self.name, e),
            }
        }

        self.flow.close();
        self.teardown.finish_shutdown();
        self.client.close();
        self.state.transition(HealthState::Failed);
        self.teardown.mark_closed();
        debug!("{}: closed", self.name);
    }
}

impl Drop for BlePort {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for BlePort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlePort")
            .field("name", &self.name)
            .field("state", &self.state.get())
            .field("flow", &self.flow)
            .finish()
    }
}
