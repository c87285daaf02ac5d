//! Concrete transports behind the [`Port`](crate::port::Port) trait.
//!
//! - [`serial`]: UARTs, USB-serial adapters and RFCOMM ttys
//! - [`ble`]: HM-10 style GATT serial modules
//! - [`tcp`]: a fan-out server for network clients

pub mod ble;
pub mod serial;
pub mod tcp;

pub use ble::{BleOptions, BlePort, GattClient, GattService};
pub use serial::{available_ports, open_serial, LineSettings, PortSummary};
pub use tcp::TcpServerPort;
