//! TCP server port: every connected client sees the same data.
//!
//! Accepted clients become lossy [`StreamPort`] members of one
//! [`AggregatingPort`]. A slow client drops data instead of stalling the
//! others, and a client that disconnects is evicted on the next write.

use crate::config::TcpConfig;
use crate::port::{
    AggregatingPort, HealthState, InputListener, IoSink, IoSource, Port, PortError,
    PortListener, PortOptions, StreamPair, StreamPort,
};
use parking_lot::Mutex;
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How often the accept loop checks for shutdown.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Bound on one blocking socket read or write.
const SOCKET_TIMEOUT: Duration = Duration::from_millis(250);

/// Listens for TCP clients and fans writes out to all of them.
pub struct TcpServerPort {
    local_addr: SocketAddr,
    clients: Arc<AggregatingPort>,
    stop: Arc<AtomicBool>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl TcpServerPort {
    /// Bind `addr` and start accepting clients.
    ///
    /// Use port 0 to let the OS pick one; see [`local_addr`](Self::local_addr).
    pub fn bind(addr: &str, options: PortOptions) -> Result<Self, PortError> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let clients = Arc::new(AggregatingPort::new(format!("tcp:{}", local_addr.port())));
        let stop = Arc::new(AtomicBool::new(false));
        let options = options.lossy();

        let acceptor = {
            let clients = clients.clone();
            let stop = stop.clone();
            thread::Builder::new()
                .name(format!("tcp-accept:{}", local_addr.port()))
                .spawn(move || accept_loop(listener, &clients, &stop, options))?
        };
        info!("tcp server listening on {}", local_addr);

        Ok(Self {
            local_addr,
            clients,
            stop,
            acceptor: Mutex::new(Some(acceptor)),
        })
    }

    pub fn from_config(config: &TcpConfig, options: PortOptions) -> Result<Self, PortError> {
        Self::bind(&format!("{}:{}", config.bind_address, config.port), options)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Clients currently attached.
    pub fn client_count(&self) -> usize {
        self.clients.member_count()
    }
}

fn accept_loop(
    listener: TcpListener,
    clients: &AggregatingPort,
    stop: &AtomicBool,
    options: PortOptions,
) {
    while !stop.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => match open_client(stream, peer, options) {
                Ok(port) => {
                    info!("tcp client {} connected", peer);
                    clients.add_member(Arc::new(port));
                }
                Err(e) => warn!("tcp client {} rejected: {}", peer, e),
            },
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                warn!("tcp accept failed: {}", e);
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
    debug!("tcp accept loop exited");
}

fn open_client(
    stream: TcpStream,
    peer: SocketAddr,
    options: PortOptions,
) -> Result<StreamPort, PortError> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(SOCKET_TIMEOUT))?;
    stream.set_write_timeout(Some(SOCKET_TIMEOUT))?;
    let writer = stream.try_clone()?;

    let pair = StreamPair::new(Box::new(IoSource(stream)), Box::new(IoSink(writer)));
    StreamPort::open(peer.to_string(), pair, options)
}

impl Port for TcpServerPort {
    fn state(&self) -> HealthState {
        self.clients.state()
    }

    fn set_listener(&self, listener: Option<Arc<dyn PortListener>>) {
        self.clients.set_listener(listener);
    }

    fn set_input_listener(&self, listener: Option<Arc<dyn InputListener>>) {
        self.clients.set_input_listener(listener);
    }

    fn write(&self, data: &[u8]) -> Result<usize, PortError> {
        self.clients.write(data)
    }

    fn drain(&self) -> Result<(), PortError> {
        self.clients.drain()
    }

    fn close(&self) {
        self.stop.store(true, Ordering::Release);
        if let Some(acceptor) = self.acceptor.lock().take() {
            if acceptor.thread().id() != thread::current().id() && acceptor.join().is_err() {
                warn!("tcp accept thread panicked");
            }
        }
        self.clients.close();
    }
}

impl Drop for TcpServerPort {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for TcpServerPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServerPort")
            .field("local_addr", &self.local_addr)
            .field("clients", &self.client_count())
            .finish()
    }
}
