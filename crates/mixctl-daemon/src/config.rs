// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Configuration management for the daemon.

use mixctl::ControlOptions;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

const CONFIG_FILE: &str = "daemon.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("No config directory found")]
    NoConfigDir,
}

/// Daemon settings persisted in `daemon.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Sound server address; the default server when unset.
    #[serde(default)]
    pub server: Option<String>,
    /// Client name announced to the sound server.
    #[serde(default = "default_client_name")]
    pub client_name: String,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// Read the stream-restore store to find the system-sounds volume.
    #[serde(default = "default_true")]
    pub restore_event_role: bool,
    /// Extra `tracing` filter directives, e.g. `"mixctl=trace"`.
    #[serde(default)]
    pub log_filter: Option<String>,
}

fn default_client_name() -> String {
    "mixctl".to_string()
}

fn default_reconnect_delay() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            server: None,
            client_name: default_client_name(),
            reconnect_delay_secs: default_reconnect_delay(),
            restore_event_role: true,
            log_filter: None,
        }
    }
}

impl DaemonConfig {
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    pub fn control_options(&self) -> ControlOptions {
        ControlOptions {
            reconnect_delay: Duration::from_secs(self.reconnect_delay_secs),
            restore_event_role: self.restore_event_role,
        }
    }
}

/// Configuration manager handles loading and saving config files.
pub struct ConfigManager {
    config_dir: PathBuf,
}

impl ConfigManager {
    /// Create a config manager for the user's XDG config directory.
    pub fn new() -> Result<Self, ConfigError> {
        let config_dir = directories::ProjectDirs::from("com", "mixctl", "mixctl")
            .map(|d| d.config_dir().to_path_buf())
            .ok_or(ConfigError::NoConfigDir)?;
        Self::with_dir(config_dir)
    }

    /// Create a config manager rooted at `config_dir`.
    pub fn with_dir(config_dir: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let config_dir = config_dir.into();
        fs::create_dir_all(&config_dir)?;
        debug!("Config directory: {:?}", config_dir);
        Ok(Self { config_dir })
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    /// Load the daemon configuration, writing the defaults if there is none.
    pub fn load_or_create(&self) -> Result<DaemonConfig, ConfigError> {
        let path = self.config_path();
        if !path.exists() {
            let config = DaemonConfig::default();
            self.save(&config)?;
            info!("Wrote default config to {:?}", path);
            return Ok(config);
        }

        let config = Self::load_from(&path)?;
        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    fn load_from(path: &Path) -> Result<DaemonConfig, ConfigError> {
        let content = fs::read_to_string(path)?;
        Ok(DaemonConfig::from_toml(&content)?)
    }

    pub fn save(&self, config: &DaemonConfig) -> Result<(), ConfigError> {
        let path = self.config_path();
        fs::write(&path, config.to_toml()?)?;
        debug!("Saved config to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_use_defaults() {
        let config = DaemonConfig::from_toml("server = \"tcp:studio\"").unwrap();
        assert_eq!(config.server.as_deref(), Some("tcp:studio"));
        assert_eq!(config.client_name, "mixctl");
        assert_eq!(config.reconnect_delay_secs, 5);
        assert!(config.restore_event_role);
        assert!(config.log_filter.is_none());
    }

    #[test]
    fn test_control_options() {
        let config = DaemonConfig {
            reconnect_delay_secs: 2,
            restore_event_role: false,
            ..DaemonConfig::default()
        };
        let options = config.control_options();
        assert_eq!(options.reconnect_delay, Duration::from_secs(2));
        assert!(!options.restore_event_role);
    }

    #[test]
    fn test_default_file_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::with_dir(dir.path().join("mixctl")).unwrap();
        assert!(!manager.config_path().exists());

        let config = manager.load_or_create().unwrap();
        assert_eq!(config, DaemonConfig::default());
        assert!(manager.config_path().exists());

        let mut changed = config;
        changed.log_filter = Some("mixctl=trace".into());
        manager.save(&changed).unwrap();
        assert_eq!(manager.load_or_create().unwrap(), changed);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::with_dir(dir.path()).unwrap();
        fs::write(manager.config_path(), "reconnect_delay_secs = \"soon\"").unwrap();
        assert!(matches!(manager.load_or_create(), Err(ConfigError::TomlParse(_))));
    }
}
