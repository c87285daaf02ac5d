//! Configuration file round-trips through the public loader API.

use flightlink::config::{
    resolve_config_path, Config, ConfigError, ConfigLoader, LogFormat,
};
use flightlink::connection::AgentOptions;
use flightlink::port::PortOptions;
use flightlink::transport::BleOptions;
use pretty_assertions::assert_eq;
use serial_test::serial;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

#[test]
#[serial]
fn test_partial_file_keeps_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("flightlink.toml");
    fs::write(
        &path,
        r#"
[serial]
default_baud = 19200

[serial.port_aliases]
flarm = "/dev/ttyUSB1"

[ble]
default_mtu = 185
"#,
    )
    .unwrap();

    let loader = ConfigLoader::load_from(&path).unwrap();
    let config = loader.config();
    assert_eq!(loader.config_path.as_deref(), Some(path.as_path()));
    assert_eq!(config.serial.default_baud, 19200);
    assert_eq!(config.serial.resolve_port("flarm"), "/dev/ttyUSB1");
    assert_eq!(config.io, Config::default().io);
    assert_eq!(config.agent, Config::default().agent);

    let ble = BleOptions::from(&config.ble);
    assert_eq!(ble.flow.chunk_size, 182);
}

#[test]
#[serial]
fn test_saved_defaults_load_back() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("flightlink.toml");

    ConfigLoader::with_defaults().unwrap().save_to(&path).unwrap();
    let loaded = ConfigLoader::load_from(&path).unwrap().into_config();
    assert_eq!(loaded, Config::default());
}

#[test]
#[serial]
fn test_sections_drive_component_options() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("flightlink.toml");
    fs::write(
        &path,
        r#"
[io]
write_buffer_size = 512
write_timeout_ms = 0

[agent]
retry_base_ms = 250
retry_max_ms = 4000

[logging]
format = "json"
"#,
    )
    .unwrap();

    let config = ConfigLoader::load_from(&path).unwrap().into_config();
    let port = PortOptions::from(&config.io);
    assert_eq!(port.writer.capacity, 512);
    assert!(port.writer.write_timeout.is_zero());

    let agent = AgentOptions::from(&config.agent);
    assert_eq!(agent.retry_base, Duration::from_millis(250));
    assert_eq!(agent.retry_max, Duration::from_secs(4));
    assert_eq!(config.logging.format, LogFormat::Json);
}

#[test]
#[serial]
fn test_malformed_file_is_a_parse_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("flightlink.toml");
    fs::write(&path, "[serial]\ndefault_baud = \"fast\"\n").unwrap();

    let err = ConfigLoader::load_from(&path).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }));
}

#[test]
#[serial]
fn test_invalid_values_fail_validation() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("flightlink.toml");
    fs::write(&path, "[io]\nwrite_buffer_size = 0\n").unwrap();

    let err = ConfigLoader::load_from(&path).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { .. }));
    assert!(err.to_string().contains("write_buffer_size"));
}

#[test]
#[serial]
fn test_explicit_path_from_environment() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("custom.toml");
    fs::write(&path, "[tcp]\nport = 2000\n").unwrap();

    std::env::set_var("FLIGHTLINK_CONFIG", &path);
    let resolved = resolve_config_path();
    let loader = ConfigLoader::load();
    std::env::remove_var("FLIGHTLINK_CONFIG");

    assert_eq!(resolved, Some(path));
    assert_eq!(loader.unwrap().config().tcp.port, 2000);
}
