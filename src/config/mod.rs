//! Configuration module for flightlink.
//!
//! This module provides TOML-based configuration with environment variable overrides.
//!
//! # Configuration Resolution
//!
//! Configuration is loaded from the following locations (in order of priority):
//!
//! 1. `FLIGHTLINK_CONFIG` environment variable (explicit path)
//! 2. `./flightlink.toml` (current directory)
//! 3. `~/.config/flightlink/flightlink.toml` (XDG on Linux/macOS)
//! 4. `%APPDATA%\flightlink\flightlink.toml` (Windows)
//! 5. Built-in defaults (no file required)
//!
//! # Environment Overrides
//!
//! Any configuration value can be overridden via environment variables.
//! The pattern is: `FLIGHTLINK_<SECTION>_<KEY>`
//!
//! Examples:
//! - `FLIGHTLINK_IO_WRITE_BUFFER_SIZE=8192`
//! - `FLIGHTLINK_SERIAL_DEFAULT_BAUD=4800`
//! - `FLIGHTLINK_BLE_DEFAULT_MTU=185`
//!
//! # Example
//!
//! ```rust,no_run
//! use flightlink::config::ConfigLoader;
//!
//! let loader = ConfigLoader::load()?;
//! let config = loader.config();
//!
//! println!("Send buffer: {} bytes", config.io.write_buffer_size);
//! println!("Default baud: {}", config.serial.default_baud);
//! # Ok::<(), flightlink::config::ConfigError>(())
//! ```

mod error;
mod loader;
mod schema;

pub use error::{ConfigError, ConfigResult};
pub use loader::{candidate_paths, get_default_config_path, resolve_config_path, ConfigLoader};
pub use schema::{
    AgentConfig, BleConfig, Config, IoConfig, LogFormat, LoggingConfig, SerialConfig, TcpConfig,
};
