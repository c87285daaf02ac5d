//! A [`Port`] over one channel of a shared link.
//!
//! The port registers with a [`ConnectionHub`] and follows the link: it opens
//! its channel when the link comes up (`Ready`) and releases it when the link
//! goes down (`Limbo`). Changing the baud rate reopens only this channel.

use super::hub::ConnectionHub;
use super::link::{Connection, LinkListener};
use crate::port::{
    HealthState, InputListener, ListenerSlot, Port, PortError, PortListener, PortOptions,
    SafeTeardown, StateCell, StreamPort,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Forwards channel input while the link port is open.
struct InputRelay(Weak<LinkPortInner>);

impl InputListener for InputRelay {
    fn on_data_received(&self, data: &[u8]) {
        let Some(owner) = self.0.upgrade() else {
            return;
        };
        let Some(_guard) = owner.teardown.enter() else {
            return;
        };
        if let Some(listener) = owner.input.get() {
            listener.on_data_received(data);
        }
    }
}

/// Watches the channel's own stream port.
struct ChannelWatcher(Weak<LinkPortInner>);

impl PortListener for ChannelWatcher {
    fn on_state_changed(&self) {}

    fn on_error(&self, message: &str) {
        if let Some(owner) = self.0.upgrade() {
            owner.channel_failed(message);
        }
    }
}

struct LinkPortInner {
    me: Weak<LinkPortInner>,
    name: String,
    channel: u32,
    baud_rate: AtomicU32,
    options: PortOptions,
    state: StateCell,
    input: Arc<ListenerSlot<dyn InputListener>>,
    current: Mutex<Option<Arc<StreamPort>>>,
    teardown: SafeTeardown,
}

impl LinkPortInner {
    fn current(&self) -> Option<Arc<StreamPort>> {
        self.current.lock().clone()
    }

    fn release_channel(&self) {
        let port = self.current.lock().take();
        if let Some(port) = port {
            debug!("{}: releasing channel {}", self.name, self.channel);
            port.close();
        }
    }

    fn channel_failed(&self, message: &str) {
        let Some(_guard) = self.teardown.enter() else {
            return;
        };
        self.state.fail_with(HealthState::Limbo, message);
    }

    fn open_channel(&self, connection: &Arc<dyn Connection>) -> Result<StreamPort, PortError> {
        let baud_rate = self.baud_rate.load(Ordering::SeqCst);
        let pair = connection.open_channel(self.channel, baud_rate)?;
        let port = StreamPort::open(
            format!("{}/{}", connection.name(), self.channel),
            pair,
            self.options,
        )?;
        port.set_input_listener(Some(Arc::new(InputRelay(self.me.clone()))));
        port.set_listener(Some(Arc::new(ChannelWatcher(self.me.clone()))));
        Ok(port)
    }
}

impl LinkListener for LinkPortInner {
    fn on_connect(&self, connection: &Arc<dyn Connection>) {
        let Some(_guard) = self.teardown.enter() else {
            return;
        };
        match self.open_channel(connection) {
            Ok(port) => {
                let previous = self.current.lock().replace(Arc::new(port));
                if let Some(previous) = previous {
                    previous.close();
                }
                info!("{}: channel {} open", self.name, self.channel);
                self.state.transition(HealthState::Ready);
            }
            Err(e) => {
                warn!("{}: cannot open channel {}: {}", self.name, self.channel, e);
                self.state
                    .fail_with(HealthState::Limbo, &format!("cannot open channel: {e}"));
            }
        }
    }

    fn on_disconnect(&self, _connection: &Arc<dyn Connection>) {
        self.release_channel();
        let Some(_guard) = self.teardown.enter() else {
            return;
        };
        self.state.transition(HealthState::Limbo);
    }
}

/// Port on channel `n` of whatever link the hub currently holds.
pub struct LinkPort {
    inner: Arc<LinkPortInner>,
    hub: Weak<ConnectionHub>,
}

impl LinkPort {
    /// Register with `hub`. The port starts in `Limbo` unless the link is
    /// already up, in which case it is `Ready` when this returns.
    pub fn open(
        hub: &Arc<ConnectionHub>,
        name: impl Into<String>,
        channel: u32,
        baud_rate: u32,
        options: PortOptions,
    ) -> Self {
        let name = name.into();
        let inner = Arc::new_cyclic(|me| LinkPortInner {
            me: me.clone(),
            name,
            channel,
            baud_rate: AtomicU32::new(baud_rate),
            options,
            state: StateCell::new(HealthState::Limbo),
            input: Arc::new(ListenerSlot::new()),
            current: Mutex::new(None),
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

    pub fn channel(&self) -> u32 {
        self.inner.channel
    }

    fn as_listener(&self) -> Arc<dyn LinkListener> {
        self.inner.clone()
    }
}

impl Port for LinkPort {
    fn state(&self) -> HealthState {
        self.inner.state.get()
    }

    fn set_listener(&self, listener: Option<Arc<dyn PortListener>>) {
        self.inner.state.listener().set(listener);
    }

    fn set_input_listener(&self, listener: Option<Arc<dyn InputListener>>) {
        self.inner.input.set(listener);
    }

    fn write(&self, data: &[u8]) -> Result<usize, PortError> {
        if self.inner.teardown.is_shutdown() {
            return Err(PortError::NotOpen);
        }
        match self.inner.current() {
            Some(port) => port.write(data),
            None => Err(PortError::NotConnected),
        }
    }

    fn drain(&self) -> Result<(), PortError> {
        match self.inner.current() {
            Some(port) => port.drain(),
            None => Err(PortError::NotConnected),
        }
    }

    fn baud_rate(&self) -> u32 {
        self.inner.baud_rate.load(Ordering::SeqCst)
    }

    fn set_baud_rate(&self, baud_rate: u32) -> Result<(), PortError> {
        if baud_rate == 0 {
            return Err(PortError::config("baud rate must be positive"));
        }
        let previous = self.inner.baud_rate.swap(baud_rate, Ordering::SeqCst);
        if previous == baud_rate || self.inner.teardown.is_shutdown() {
            return Ok(());
        }
        debug!("{}: baud rate {} -> {}", self.inner.name, previous, baud_rate);
        if let Some(hub) = self.hub.upgrade() {
            hub.cycle_listener(&self.as_listener());
        }
        Ok(())
    }

    fn close(&self) {
        if !self.inner.teardown.begin_shutdown() {
            self.inner.teardown.wait_closed();
            return;
        }
        self.inner.input.clear();
        self.inner.state.listener().clear();
        if let Some(hub) = self.hub.upgrade() {
            hub.remove_listener(&self.as_listener());
        }
        self.inner.release_channel();
        self.inner.teardown.finish_shutdown();
        // An open that was in flight during shutdown may have stored a port.
        self.inner.release_channel();
        self.inner.state.transition(HealthState::Failed);
        self.inner.teardown.mark_closed();
        info!("{} closed", self.inner.name);
    }
}

impl Drop for LinkPort {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for LinkPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkPort")
            .field("name", &self.inner.name)
            .field("channel", &self.inner.channel)
            .field("state", &self.state())
            .finish()
    }
}
