//! # Configuration Management Module
//!
//! Persistent settings for the sync client, stored in platform-appropriate
//! locations. Handles loading and providing defaults; a missing file is
//! written out with the defaults so it can be edited by hand.
//!
//! ## Settings
//! - `enable_autoconnect`: reconnect to the last paired sensor on startup
//! - `connect_timeout_secs`: upper bound on a single native connect call
//! - `scan_duration_secs`: how long discovery listens for advertisements
//! - `device_name_prefix`: advertised-name prefix of AirScale sensors
//!
//! ## Storage Location
//! - macOS: ~/Library/Application Support/airscale/config.toml
//! - Linux: ~/.config/airscale/config.toml
//! - Windows: %APPDATA%\airscale\config.toml
//!
//! ## Why TOML
//! Human-readable format allows manual editing if needed. Missing keys fall
//! back to their defaults, so older files keep loading after new settings
//! are added.

use crate::device_scanner::DEVICE_NAME_PREFIX;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub enable_autoconnect: bool,
    pub connect_timeout_secs: u64,
    pub scan_duration_secs: u64,
    pub device_name_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enable_autoconnect: true,
            connect_timeout_secs: 10,
            scan_duration_secs: 5,
            device_name_prefix: DEVICE_NAME_PREFIX.to_string(),
        }
    }
}

impl Config {
    /// Get the path to the config file
    pub fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        config_dir.join("airscale").join("config.toml")
    }

    /// Load config from the default location, creating it if absent
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load config from `path`, writing defaults there if the file doesn't exist
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => Ok(toml::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.save_to(path)?;
                Ok(config)
            }
            Err(e) => Err(ConfigError::ReadFailed(e)),
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ConfigError::WriteFailed)?;
        }

        let toml_string = toml::to_string_pretty(self)?;
        fs::write(path, toml_string).map_err(ConfigError::WriteFailed)?;

        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn scan_duration(&self) -> Duration {
        Duration::from_secs(self.scan_duration_secs)
    }
}
