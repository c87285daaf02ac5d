//! Flightlink Library
//!
//! Transport-agnostic byte-stream ports for talking to flight peripherals
//! over unreliable links: serial adapters, BLE modules, shared I/O boards
//! and network clients.
//!
//! # Modules
//!
//! - `port`: The `Port` trait, health model, buffered I/O workers and teardown guard
//! - `connection`: Connection agents and multiplexing of shared hardware links
//! - `transport`: Serial, BLE and TCP implementations of `Port`
//! - `config`: Configuration management with TOML support
//! - `logging`: Tracing subscriber setup
//! - `error`: Application-level error type

pub mod config;
pub mod connection;
pub mod error;
pub mod logging;
pub mod port;
pub mod transport;

// Re-export commonly used types for convenience
pub use error::{AppError, AppResult};
pub use port::{HealthState, InputListener, Port, PortError, PortListener, PortOptions};

pub use connection::{
    AgentOptions, Connection, ConnectionFactory, ConnectionHub, LinkError, LinkPort,
};

// Re-export config types
pub use config::{Config, ConfigError, ConfigLoader, ConfigResult};
