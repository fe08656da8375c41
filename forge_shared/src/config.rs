//! # Fleet Configuration
//!
//! One TOML file describes the host server and every attached device.
//!
//! ## Example: TOML Configuration
//!
//! ```toml
//! [server]
//! listen = "127.0.0.1:3000"
//! tick_interval_secs = 10
//!
//! [[devices]]
//! id = "mk3-left"
//! port = "/dev/ttyACM0"
//! baud = 115200
//! model = "marlin"
//!
//! [devices.offsets]
//! z = 0.2
//! ```
//!
//! ## Example: Rust Usage
//!
//! ```rust
//! use forge_shared::config::Config;
//! let toml_str = r#"
//! [[devices]]
//! id = "mk3-left"
//! port = "/dev/ttyACM0"
//! model = "marlin"
//!
//! [devices.offsets]
//! z = 0.2
//! "#;
//! let config: Config = toml::from_str(toml_str).unwrap();
//! assert_eq!(config.devices[0].offsets.z, 0.2);
//! assert_eq!(config.devices[0].baud, 115200);
//! assert!(config.validate().is_ok());
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Directory for persisted job records. Jobs live in memory only when unset.
    #[serde(default)]
    pub job_store: Option<String>,
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            job_store: None,
            tick_interval_secs: default_tick_interval_secs(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl ServerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Serial,
    Simulated,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    pub id: String,
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default)]
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default = "default_model")]
    pub model: String,
    /// Overrides the model's checksum capability when set.
    #[serde(default)]
    pub checksum: Option<bool>,
    /// Overrides the model's axis offsets when set.
    #[serde(default)]
    pub offsets: AxisOffsets,
    #[serde(default = "default_response_timeout_secs")]
    pub response_timeout_secs: u64,
    #[serde(default = "default_lift_clearance")]
    pub lift_clearance: f64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            transport: TransportKind::default(),
            port: String::new(),
            baud: default_baud(),
            model: default_model(),
            checksum: None,
            offsets: AxisOffsets::default(),
            response_timeout_secs: default_response_timeout_secs(),
            lift_clearance: default_lift_clearance(),
        }
    }
}

impl DeviceConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }
}

/// Per-axis offsets subtracted from reported positions.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq)]
pub struct AxisOffsets {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub z: f64,
}

impl AxisOffsets {
    pub fn is_zero(&self) -> bool {
        self.x == 0.0 && self.y == 0.0 && self.z == 0.0
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.tick_interval_secs == 0 {
            return Err(ConfigError::Invalid("server.tick_interval_secs must be > 0".to_string()));
        }
        let mut seen = HashSet::new();
        for device in &self.devices {
            if device.id.is_empty() {
                return Err(ConfigError::Invalid("device id cannot be empty".to_string()));
            }
            if !seen.insert(device.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate device id '{}'", device.id)));
            }
            if device.transport == TransportKind::Serial && device.port.is_empty() {
                return Err(ConfigError::Invalid(format!("device '{}' has no serial port", device.id)));
            }
            if device.response_timeout_secs == 0 {
                return Err(ConfigError::Invalid(format!(
                    "device '{}' response_timeout_secs must be > 0",
                    device.id
                )));
            }
            if device.lift_clearance < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "device '{}' lift_clearance must be >= 0",
                    device.id
                )));
            }
        }
        Ok(())
    }
}

fn default_listen() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_tick_interval_secs() -> u64 {
    10
}

fn default_event_buffer() -> usize {
    256
}

fn default_baud() -> u32 {
    115200
}

fn default_model() -> String {
    "marlin".to_string()
}

fn default_response_timeout_secs() -> u64 {
    120
}

fn default_lift_clearance() -> f64 {
    10.0
}

pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path, e);
            return Err(ConfigError::Io(e));
        }
    };
    let config: Config = match toml::from_str(&contents) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to parse config TOML: {}", e);
            return Err(ConfigError::Toml(e));
        }
    };
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_fill_missing_sections() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:3000");
        assert_eq!(config.server.tick_interval(), Duration::from_secs(10));
        assert!(config.devices.is_empty());
    }

    #[test]
    fn simulated_device_needs_no_port() {
        let config: Config = toml::from_str(
            r#"
            [[devices]]
            id = "sim"
            transport = "simulated"
            checksum = false
            "#,
        )
        .unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.devices[0].checksum, Some(false));
        assert!(config.devices[0].offsets.is_zero());
    }

    #[test]
    fn rejects_duplicate_ids() {
        let config: Config = toml::from_str(
            r#"
            [[devices]]
            id = "a"
            transport = "simulated"
            [[devices]]
            id = "a"
            transport = "simulated"
            "#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn load_config_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nlisten = \"127.0.0.1:9000\"").unwrap();
        let config = load_config(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:9000");
    }

    #[test]
    fn load_config_reports_missing_file() {
        let err = load_config("/nonexistent/forge.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
