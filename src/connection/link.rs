//! Boundary traits for shared hardware links.
//!
//! A [`ConnectionFactory`] knows how to reach one kind of link (a USB IOIO
//! board, a Bluetooth IOIO, an emulator socket). The [`Connection`] it returns
//! is shared by every consumer that opens a channel on it.

use super::agent::LinkNotifier;
use super::cancel::CancelToken;
use super::error::LinkError;
use crate::port::{PortError, StreamPair};
use std::sync::Arc;

/// An open shared link.
pub trait Connection: Send + Sync {
    /// Human-readable identity, used in logs.
    fn name(&self) -> &str;

    /// Reset handshake performed once after every successful open.
    fn soft_reset(&self) -> Result<(), LinkError>;

    /// Cheap liveness probe, polled by the agent while connected.
    fn is_alive(&self) -> bool;

    /// Open a byte channel (UART number, pipe, sub-address) on the link.
    fn open_channel(&self, channel: u32, baud_rate: u32) -> Result<StreamPair, PortError>;

    /// Tear the link down. Called exactly once by the agent that opened it.
    fn disconnect(&self);
}

/// Opens connections to one kind of shared link.
pub trait ConnectionFactory: Send + Sync {
    fn name(&self) -> &str;

    /// Block until a connection is established, the attempt fails, or
    /// `cancel` fires.
    ///
    /// The factory must check `cancel` at each blocking boundary and return
    /// [`LinkError::Cancelled`] when it has fired. `notifier` stays valid for
    /// the lifetime of the returned connection; call
    /// [`LinkNotifier::link_failed`] when the link drops asynchronously.
    fn open(
        &self,
        cancel: &CancelToken,
        notifier: LinkNotifier,
    ) -> Result<Arc<dyn Connection>, LinkError>;
}

/// Observer of a link's connect/disconnect events.
///
/// Implemented by connection consumers, by the multiplexer and by the
/// factory arbiter, so events can be chained through each level.
pub trait LinkListener: Send + Sync {
    fn on_connect(&self, connection: &Arc<dyn Connection>);

    fn on_disconnect(&self, connection: &Arc<dyn Connection>);

    /// Called on the agent thread after every loop iteration.
    fn on_idle(&self, _connection: Option<&Arc<dyn Connection>>) {}
}

/// Identity comparison for shared trait objects.
pub(crate) fn same_object<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}
