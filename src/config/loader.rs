//! Finding, reading and overriding the configuration file.

use super::error::{ConfigError, ConfigResult};
use super::schema::Config;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const ENV_PREFIX: &str = "FLIGHTLINK";
const CONFIG_FILE_NAME: &str = "flightlink.toml";
const CONFIG_PATH_ENV: &str = "FLIGHTLINK_CONFIG";
const APP_DIR_NAME: &str = "flightlink";

/// A validated [`Config`] and the file it came from.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    /// File the configuration was read from; `None` for built-in defaults.
    pub config_path: Option<PathBuf>,
    pub config: Config,
}

impl ConfigLoader {
    /// Load from the first existing file in [`candidate_paths`], or the
    /// built-in defaults when there is none.
    ///
    /// `FLIGHTLINK_<SECTION>_<KEY>` variables are applied on top and the
    /// result is validated.
    pub fn load() -> ConfigResult<Self> {
        match resolve_config_path() {
            Some(path) => {
                let config = load_from_file(&path)?;
                Self::finish(Some(path), config)
            }
            None => Self::finish(None, Config::default()),
        }
    }

    /// Load a specific file. Unlike [`load`](Self::load), a missing file is
    /// an error.
    pub fn load_from(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let config = load_from_file(path)?;
        Self::finish(Some(path.to_path_buf()), config)
    }

    /// Built-in defaults plus environment overrides.
    pub fn with_defaults() -> ConfigResult<Self> {
        Self::finish(None, Config::default())
    }

    fn finish(config_path: Option<PathBuf>, mut config: Config) -> ConfigResult<Self> {
        apply_env_overrides(&mut config)?;
        config.validate()?;
        Ok(Self {
            config_path,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn into_config(self) -> Config {
        self.config
    }

    /// Write the configuration as TOML, creating parent directories.
    pub fn save_to(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        save_to_file(&self.config, path.as_ref())
    }
}

/// Places searched for a configuration file, highest priority first:
/// `$FLIGHTLINK_CONFIG`, `./flightlink.toml`, then the per-user config
/// directory.
pub fn candidate_paths() -> Vec<PathBuf> {
    let mut paths = Vec::with_capacity(3);
    if let Some(explicit) = std::env::var_os(CONFIG_PATH_ENV) {
        paths.push(PathBuf::from(explicit));
    }
    paths.push(PathBuf::from(CONFIG_FILE_NAME));
    paths.extend(get_default_config_path());
    paths
}

/// The first of [`candidate_paths`] that exists.
pub fn resolve_config_path() -> Option<PathBuf> {
    candidate_paths().into_iter().find(|path| path.is_file())
}

/// `%APPDATA%` on Windows, `$XDG_CONFIG_HOME` or `~/.config` elsewhere.
fn get_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(PathBuf::from)
    }

    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
    }
}

/// Where `flightlink config init` writes by default.
pub fn get_default_config_path() -> Option<PathBuf> {
    get_config_dir().map(|d| d.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
}

fn load_from_file(path: &Path) -> ConfigResult<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::read(path, e))?;

    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn save_to_file(config: &Config, path: &Path) -> ConfigResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| ConfigError::write(path, e))?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|e| ConfigError::write(path, e))
}

/// Parse `FLIGHTLINK_<key>` into `target` if it is set.
fn override_from_env<T: FromStr>(key: &str, target: &mut T) -> ConfigResult<()> {
    let var = format!("{}_{}", ENV_PREFIX, key);
    if let Ok(val) = std::env::var(&var) {
        *target = val
            .trim()
            .parse()
            .map_err(|_| ConfigError::env_parse(var, format!("invalid value '{val}'")))?;
    }
    Ok(())
}

/// Apply environment variable overrides to the configuration.
///
/// Environment variables follow the pattern: `FLIGHTLINK_<SECTION>_<KEY>`
/// For example:
/// - `FLIGHTLINK_IO_WRITE_TIMEOUT_MS=0`
/// - `FLIGHTLINK_SERIAL_DEFAULT_BAUD=4800`
/// - `FLIGHTLINK_LOGGING_LEVEL=debug`
fn apply_env_overrides(config: &mut Config) -> ConfigResult<()> {
    override_from_env("IO_READ_CHUNK_SIZE", &mut config.io.read_chunk_size)?;
    override_from_env("IO_WRITE_BUFFER_SIZE", &mut config.io.write_buffer_size)?;
    override_from_env("IO_WRITE_TIMEOUT_MS", &mut config.io.write_timeout_ms)?;
    override_from_env("IO_DRAIN_TIMEOUT_MS", &mut config.io.drain_timeout_ms)?;

    override_from_env("SERIAL_DEFAULT_BAUD", &mut config.serial.default_baud)?;
    override_from_env("SERIAL_READ_TIMEOUT_MS", &mut config.serial.read_timeout_ms)?;
    override_from_env(
        "SERIAL_HARDWARE_FLOW_CONTROL",
        &mut config.serial.hardware_flow_control,
    )?;

    override_from_env("BLE_BUFFER_CAPACITY", &mut config.ble.buffer_capacity)?;
    override_from_env("BLE_DEFAULT_MTU", &mut config.ble.default_mtu)?;
    override_from_env(
        "BLE_DISCONNECT_TIMEOUT_MS",
        &mut config.ble.disconnect_timeout_ms,
    )?;

    override_from_env("AGENT_RETRY_BASE_MS", &mut config.agent.retry_base_ms)?;
    override_from_env("AGENT_RETRY_MAX_MS", &mut config.agent.retry_max_ms)?;
    override_from_env("AGENT_POLL_INTERVAL_MS", &mut config.agent.poll_interval_ms)?;

    override_from_env("TCP_BIND_ADDRESS", &mut config.tcp.bind_address)?;
    override_from_env("TCP_PORT", &mut config.tcp.port)?;

    override_from_env("LOGGING_LEVEL", &mut config.logging.level)?;
    override_from_env("LOGGING_FORMAT", &mut config.logging.format)?;
    if let Ok(val) = std::env::var(format!("{}_LOGGING_FILE", ENV_PREFIX)) {
        config.logging.file = Some(PathBuf::from(val));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogFormat;
    use serial_test::serial;
    use std::env;

    #[test]
    #[serial]
    fn test_default_loader() {
        let loader = ConfigLoader::with_defaults().unwrap();
        assert_eq!(loader.config().io.write_buffer_size, 4096);
        assert!(loader.config_path.is_none());
    }

    #[test]
    #[serial]
    fn test_env_override() {
        env::set_var("FLIGHTLINK_TCP_PORT", "10110");
        env::set_var("FLIGHTLINK_LOGGING_FORMAT", "compact");

        let loader = ConfigLoader::with_defaults().unwrap();
        assert_eq!(loader.config().tcp.port, 10110);
        assert_eq!(loader.config().logging.format, LogFormat::Compact);

        env::remove_var("FLIGHTLINK_TCP_PORT");
        env::remove_var("FLIGHTLINK_LOGGING_FORMAT");
    }

    #[test]
    #[serial]
    fn test_invalid_env_value() {
        env::set_var("FLIGHTLINK_SERIAL_DEFAULT_BAUD", "fast");

        let err = ConfigLoader::with_defaults().unwrap_err();
        assert!(matches!(err, ConfigError::Env { .. }));
        assert!(err.to_string().contains("FLIGHTLINK_SERIAL_DEFAULT_BAUD"));

        env::remove_var("FLIGHTLINK_SERIAL_DEFAULT_BAUD");
    }

    #[test]
    #[serial]
    fn test_env_override_is_validated() {
        env::set_var("FLIGHTLINK_BLE_DEFAULT_MTU", "2");

        let err = ConfigLoader::with_defaults().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));

        env::remove_var("FLIGHTLINK_BLE_DEFAULT_MTU");
    }

    #[test]
    #[serial]
    fn test_explicit_path_is_searched_first() {
        env::set_var("FLIGHTLINK_CONFIG", "/tmp/flightlink-explicit.toml");
        let paths = candidate_paths();
        env::remove_var("FLIGHTLINK_CONFIG");

        assert_eq!(paths[0], PathBuf::from("/tmp/flightlink-explicit.toml"));
        assert_eq!(paths[1], PathBuf::from("flightlink.toml"));
    }

    #[test]
    #[serial]
    fn test_load_from_missing_file() {
        let err = ConfigLoader::load_from("/nonexistent/flightlink.toml").unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }
}
