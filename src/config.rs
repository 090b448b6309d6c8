//! Host configuration.
//!
//! Configuration is loaded from multiple sources in priority order:
//! 1. Environment variables (`PLCVM_PORT`, `PLCVM_BAUD`)
//! 2. Project-local config file (`./plcvm.toml`)
//! 3. User config file (`~/.config/plcvm/config.toml`)
//! 4. Built-in defaults
//!
//! # Config File Format
//!
//! ```toml
//! # plcvm.toml
//!
//! # Serial port of the target device (auto-detected when unset)
//! port = "/dev/ttyACM0"
//!
//! # Baud rate (default 115200)
//! baud = 115200
//!
//! # Per-operation response timeout in milliseconds (default 5000)
//! response_timeout_ms = 5000
//!
//! # Settle delay after reset/start/stop in milliseconds (default 500)
//! settle_ms = 500
//! ```

use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Global cached configuration.
static CONFIG: OnceLock<Config> = OnceLock::new();

/// Host toolchain configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Serial port of the target device.
    /// When unset, the first USB serial device is used.
    pub port: Option<String>,

    /// Baud rate of the serial link.
    pub baud: Option<u32>,

    /// Per-operation response timeout, milliseconds.
    pub response_timeout_ms: Option<u64>,

    /// Settle delay after state-changing commands, milliseconds.
    pub settle_ms: Option<u64>,
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Project-local `plcvm.toml`
    /// 3. User config `~/.config/plcvm/config.toml`
    /// 4. Defaults
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(user_config) = Self::load_user_config() {
            config.merge(user_config);
        }
        if let Some(local_config) = Self::load_local_config() {
            config.merge(local_config);
        }
        config.apply_env_overrides();

        config
    }

    /// Get the cached global configuration.
    ///
    /// Loads configuration on first call and caches it.
    pub fn get() -> &'static Config {
        CONFIG.get_or_init(|| {
            let config = Self::load();
            log::debug!("loaded configuration: {:?}", config);
            config
        })
    }

    fn load_user_config() -> Option<Config> {
        let home = std::env::var_os("HOME")?;
        let path = PathBuf::from(home).join(".config/plcvm/config.toml");
        Self::load_file(&path)
    }

    fn load_local_config() -> Option<Config> {
        Self::load_file(&PathBuf::from("plcvm.toml"))
    }

    fn load_file(path: &PathBuf) -> Option<Config> {
        let contents = std::fs::read_to_string(path).ok()?;
        match toml::from_str(&contents) {
            Ok(config) => Some(config),
            Err(e) => {
                log::warn!("ignoring malformed config {}: {e}", path.display());
                None
            }
        }
    }

    /// Overlay another config; set fields win.
    fn merge(&mut self, other: Config) {
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.baud.is_some() {
            self.baud = other.baud;
        }
        if other.response_timeout_ms.is_some() {
            self.response_timeout_ms = other.response_timeout_ms;
        }
        if other.settle_ms.is_some() {
            self.settle_ms = other.settle_ms;
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("PLCVM_PORT") {
            if !port.is_empty() {
                self.port = Some(port);
            }
        }
        if let Ok(baud) = std::env::var("PLCVM_BAUD") {
            match baud.parse() {
                Ok(b) => self.baud = Some(b),
                Err(_) => log::warn!("ignoring non-numeric PLCVM_BAUD: {baud}"),
            }
        }
    }

    /// Configured serial port, if any.
    pub fn port(&self) -> Option<&str> {
        self.port.as_deref()
    }

    /// Baud rate, defaulting to 115200.
    pub fn baud(&self) -> u32 {
        self.baud.unwrap_or(115_200)
    }

    /// Per-operation response timeout, defaulting to 5 seconds.
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms.unwrap_or(5_000))
    }

    /// Settle delay, defaulting to 500 ms.
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms.unwrap_or(500))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port(), None);
        assert_eq!(config.baud(), 115_200);
        assert_eq!(config.response_timeout(), Duration::from_secs(5));
        assert_eq!(config.settle(), Duration::from_millis(500));
    }

    #[test]
    fn test_merge_prefers_set_fields() {
        let mut base = Config {
            port: Some("/dev/ttyACM0".into()),
            baud: Some(9600),
            ..Config::default()
        };
        base.merge(Config {
            baud: Some(115_200),
            settle_ms: Some(100),
            ..Config::default()
        });
        assert_eq!(base.port(), Some("/dev/ttyACM0"));
        assert_eq!(base.baud(), 115_200);
        assert_eq!(base.settle(), Duration::from_millis(100));
    }

    #[test]
    fn test_toml_round_trip() {
        let config: Config = toml::from_str("port = \"/dev/ttyUSB0\"\nbaud = 57600\n").unwrap();
        assert_eq!(config.port(), Some("/dev/ttyUSB0"));
        assert_eq!(config.baud(), 57_600);
        assert_eq!(config.response_timeout(), Duration::from_secs(5));
    }
}
