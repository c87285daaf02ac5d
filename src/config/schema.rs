//! Configuration schema definitions.
//!
//! Every section has defaults, so an empty file (or no file) is a valid
//! configuration.

use super::error::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Buffering shared by stream-backed ports
    pub io: IoConfig,
    /// Serial / USB-serial / RFCOMM devices
    pub serial: SerialConfig,
    /// Bluetooth LE GATT ports
    pub ble: BleConfig,
    /// Shared-link connection agents
    pub agent: AgentConfig,
    /// TCP fan-out server
    pub tcp: TcpConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Reject values the ports cannot work with.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.io.read_chunk_size == 0 {
            return Err(ConfigError::validation("io.read_chunk_size", "must be positive"));
        }
        if self.io.write_buffer_size == 0 {
            return Err(ConfigError::validation("io.write_buffer_size", "must be positive"));
        }
        if self.serial.default_baud == 0 {
            return Err(ConfigError::validation("serial.default_baud", "must be positive"));
        }
        if self.ble.buffer_capacity == 0 {
            return Err(ConfigError::validation("ble.buffer_capacity", "must be positive"));
        }
        if self.ble.default_mtu < 4 {
            return Err(ConfigError::validation(
                "ble.default_mtu",
                format!("{} leaves no room after the 3-byte ATT header", self.ble.default_mtu),
            ));
        }
        if self.agent.retry_base_ms == 0 {
            return Err(ConfigError::validation("agent.retry_base_ms", "must be positive"));
        }
        if self.agent.retry_max_ms < self.agent.retry_base_ms {
            return Err(ConfigError::validation(
                "agent.retry_max_ms",
                "must not be below agent.retry_base_ms",
            ));
        }
        if self.agent.poll_interval_ms == 0 {
            return Err(ConfigError::validation("agent.poll_interval_ms", "must be positive"));
        }
        Ok(())
    }
}

/// Buffer sizing for stream-backed ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IoConfig {
    /// Maximum bytes handed to one input callback
    pub read_chunk_size: usize,
    /// Capacity of each port's send buffer
    pub write_buffer_size: usize,
    /// How long `write` waits for space; 0 drops instead of waiting
    pub write_timeout_ms: u64,
    /// How long `drain` waits for the buffer to empty
    pub drain_timeout_ms: u64,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: 1024,
            write_buffer_size: 4096,
            write_timeout_ms: 5000,
            drain_timeout_ms: 5000,
        }
    }
}

impl IoConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Serial port configuration section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Baud rate used when none is given
    pub default_baud: u32,
    /// Bound on one blocking read, so closes are noticed promptly
    pub read_timeout_ms: u64,
    /// Use RTS/CTS flow control
    pub hardware_flow_control: bool,
    /// Port aliases for convenience
    #[serde(default)]
    pub port_aliases: HashMap<String, String>,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            default_baud: 9600,
            read_timeout_ms: 250,
            hardware_flow_control: false,
            port_aliases: HashMap::new(),
        }
    }
}

impl SerialConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Resolve a port name through aliases
    pub fn resolve_port(&self, name: &str) -> String {
        self.port_aliases
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }
}

/// Bluetooth LE configuration section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    /// Capacity of the outgoing chunk buffer
    pub buffer_capacity: usize,
    /// ATT MTU assumed until the peer reports one
    pub default_mtu: u16,
    /// MTU to ask the peer for after connecting, if any
    pub request_mtu: Option<u16>,
    /// How long `write` waits for buffer space
    pub write_timeout_ms: u64,
    /// How long `drain` waits for the last chunk
    pub drain_timeout_ms: u64,
    /// How long `close` waits for the disconnect confirmation
    pub disconnect_timeout_ms: u64,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 256,
            default_mtu: 23,
            request_mtu: None,
            write_timeout_ms: 5000,
            drain_timeout_ms: 5000,
            disconnect_timeout_ms: 500,
        }
    }
}

impl BleConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }
}

/// Connection agent configuration section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Delay after the first failed attempt
    pub retry_base_ms: u64,
    /// Upper bound for the retry delay
    pub retry_max_ms: u64,
    /// How often an idle link is checked
    pub poll_interval_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            retry_base_ms: 500,
            retry_max_ms: 30_000,
            poll_interval_ms: 1000,
        }
    }
}

impl AgentConfig {
    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub fn retry_max(&self) -> Duration {
        Duration::from_millis(self.retry_max_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// TCP server configuration section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    /// Address to bind to
    pub bind_address: String,
    /// Port to listen on
    pub port: u16,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 4353,
        }
    }
}

/// Logging configuration section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive: "trace", "debug", "info", "warn", "error",
    /// or a full `RUST_LOG`-style filter
    pub level: String,
    /// Log file path (optional, stderr otherwise)
    pub file: Option<PathBuf>,
    /// Log format: "json", "pretty", "compact"
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            format: LogFormat::Pretty,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format
    Json,
    /// Pretty format with colors
    #[default]
    Pretty,
    /// Compact format
    Compact,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.io.write_buffer_size, 4096);
        assert_eq!(config.serial.default_baud, 9600);
        assert_eq!(config.ble.default_mtu, 23);
        assert_eq!(config.ble.disconnect_timeout(), Duration::from_millis(500));
        assert_eq!(config.tcp.port, 4353);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_port_alias_resolution() {
        let mut config = SerialConfig::default();
        config
            .port_aliases
            .insert("flarm".to_string(), "/dev/ttyUSB0".to_string());

        assert_eq!(config.resolve_port("flarm"), "/dev/ttyUSB0");
        assert_eq!(config.resolve_port("/dev/rfcomm0"), "/dev/rfcomm0");
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[io]"));
        assert!(toml_str.contains("[ble]"));
        assert!(toml_str.contains("[agent]"));

        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_config_deserialization() {
        let toml_str = r#"
            [io]
            write_timeout_ms = 0

            [serial]
            default_baud = 4800

            [logging]
            format = "json"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.io.write_timeout(), Duration::ZERO);
        assert_eq!(config.serial.default_baud, 4800);
        assert_eq!(config.logging.format, LogFormat::Json);
        // Defaults should still work
        assert_eq!(config.io.read_chunk_size, 1024);
    }

    #[test]
    fn test_validate_rejects_tiny_mtu() {
        let mut config = Config::default();
        config.ble.default_mtu = 3;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("ble.default_mtu"));
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = Config::default();
        config.io.write_buffer_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.ble.buffer_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_retry_bounds() {
        let mut config = Config::default();
        config.agent.retry_max_ms = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("JSON".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
