//! Shared hardware links.
//!
//! Some transports are a single physical link carrying several logical
//! channels (an IOIO board with UARTs and a TWI bus). This module keeps such
//! a link open while anyone needs it and distributes connect/disconnect
//! events to every consumer:
//!
//! ```text
//! ConnectionFactory ─► ConnectionAgent ─┐
//! ConnectionFactory ─► ConnectionAgent ─┼─► FactoryArbiter ─► ConnectionMultiplexer ─► LinkPort / LinkedSensor
//! ```

pub mod agent;
pub mod backoff;
pub mod cancel;
pub mod error;
pub mod hub;
pub mod link;
pub mod link_port;
pub mod mock;
pub mod multiplexer;
pub mod sensor;

pub use agent::{AgentOptions, AgentPhase, ConnectionAgent, LinkNotifier};
pub use backoff::{retry_delay, Backoff};
pub use cancel::CancelToken;
pub use error::LinkError;
pub use hub::ConnectionHub;
pub use link::{Connection, ConnectionFactory, LinkListener};
pub use link_port::LinkPort;
pub use mock::{LinkEvent, MockConnection, MockFactory, RecordingListener};
pub use multiplexer::{ConnectionMultiplexer, FactoryArbiter};
pub use sensor::{LinkedSensor, Sensor, SensorDriver};
