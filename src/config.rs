//! Configuration management for the EPD driver.
//!
//! Handles loading and validating configuration from JSON files. Every
//! field is optional: device paths fall back to sysfs/metadata
//! discovery and tunables fall back to their defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::waveform::table::DEFAULT_CLASSIFY_TEMPERATURE;
use crate::waveform::Temperature;

/// Default configuration file path
#[allow(dead_code)]
pub const DEFAULT_CONFIG_PATH: &str = "/etc/epdfb.json";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config JSON: {0}")]
    ParseError(#[from] serde_json::Error),
}

/// Driver configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Framebuffer device path; discovered through sysfs when unset
    pub framebuffer_path: Option<PathBuf>,

    /// Temperature sensor path; discovered through sysfs when unset
    pub temperature_sensor_path: Option<PathBuf>,

    /// Waveform (WBF) file path; discovered through the panel metadata
    /// barcode when unset
    pub waveform_path: Option<PathBuf>,

    /// Temperature at which mode kinds are sampled during waveform
    /// table classification, in Celsius
    pub classify_temperature: Temperature,

    /// Idle time after which the panel is powered down, in milliseconds
    pub idle_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            framebuffer_path: None,
            temperature_sensor_path: None,
            waveform_path: None,
            classify_temperature: DEFAULT_CLASSIFY_TEMPERATURE,
            idle_timeout_ms: 3000,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&contents)?;
        Ok(config)
    }

    /// Idle power-down timeout as a duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_missing_fields() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.classify_temperature, 21);
        assert_eq!(config.idle_timeout(), Duration::from_millis(3000));
    }

    #[test]
    fn partial_config_overrides_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"waveform_path": "/tmp/panel.wbf", "idle_timeout_ms": 500}"#)
                .unwrap();
        assert_eq!(config.waveform_path, Some(PathBuf::from("/tmp/panel.wbf")));
        assert_eq!(config.idle_timeout(), Duration::from_millis(500));
        assert_eq!(config.framebuffer_path, None);
    }
}
