// Configuration management for the credlink CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/credlink/config.json
// - Linux: ~/.config/credlink/config.json
// - Windows: %APPDATA%\credlink\config.json

use anyhow::{Context, Result};
use credlink_core::{SessionConfig, WriteType};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Only connect to peripherals whose advertised name contains this
    pub device_name: Option<String>,

    /// How long to scan for the credential service, in seconds
    pub scan_timeout_secs: u64,

    /// How long to wait for the link to become ready, in seconds
    pub ready_timeout_secs: u64,

    /// How long to wait for the transfer to finish, in seconds
    pub transfer_timeout_secs: u64,

    /// Session settings
    pub session: SessionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_name: None,
            scan_timeout_secs: 10,
            ready_timeout_secs: 15,
            transfer_timeout_secs: 30,
            session: SessionConfig::default(),
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("credlink");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    /// Load config from `path`, or write and return the default if it does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            config
                .session
                .validate()
                .context("Invalid session settings in config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    /// Set a config value. Nothing changes if the value is rejected; the
    /// caller persists the result.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut updated = self.clone();
        match key {
            "device_name" => {
                updated.device_name = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "scan_timeout" => {
                updated.scan_timeout_secs = value.parse().context("Invalid number of seconds")?;
            }
            "ready_timeout" => {
                updated.ready_timeout_secs = value.parse().context("Invalid number of seconds")?;
            }
            "transfer_timeout" => {
                updated.transfer_timeout_secs = value.parse().context("Invalid number of seconds")?;
            }
            "max_body_size" => {
                updated.session.max_body_size = value.parse().context("Invalid number")?;
            }
            "requested_mtu" => {
                updated.session.requested_mtu = value.parse().context("Invalid MTU")?;
            }
            "write_type" => {
                updated.session.write_type = match value {
                    "with_response" => WriteType::WithResponse,
                    "without_response" => WriteType::WithoutResponse,
                    _ => anyhow::bail!("Invalid write type: {} (with_response|without_response)", value),
                };
            }
            "write_queue_depth" => {
                updated.session.write_queue_depth = value.parse().context("Invalid number")?;
            }
            "read_on_ready" => {
                updated.session.read_on_ready = value.parse().context("Invalid boolean value")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        updated.session.validate().context("Rejected session setting")?;
        *self = updated;
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        self.list()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            (
                "device_name".to_string(),
                self.device_name.clone().unwrap_or_else(|| "(any)".to_string()),
            ),
            ("scan_timeout".to_string(), self.scan_timeout_secs.to_string()),
            ("ready_timeout".to_string(), self.ready_timeout_secs.to_string()),
            ("transfer_timeout".to_string(), self.transfer_timeout_secs.to_string()),
            ("max_body_size".to_string(), self.session.max_body_size.to_string()),
            ("requested_mtu".to_string(), self.session.requested_mtu.to_string()),
            ("write_type".to_string(), self.session.write_type.to_string()),
            ("write_queue_depth".to_string(), self.session.write_queue_depth.to_string()),
            ("read_on_ready".to_string(), self.session.read_on_ready.to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.device_name, None);
        assert_eq!(config.scan_timeout(), Duration::from_secs(10));
        assert_eq!(config.session, SessionConfig::default());
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.json");

        let config = Config::load_from(&path).expect("load");
        assert!(path.exists());
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_set_and_reload() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.json");

        let mut config = Config::load_from(&path).expect("load");
        config.set("device_name", "Reader").expect("set name");
        config.set("max_body_size", "128").expect("set body size");
        config.set("write_type", "with_response").expect("set write type");
        config.save_to(&path).expect("save");

        let reloaded = Config::load_from(&path).expect("reload");
        assert_eq!(reloaded.get("device_name").as_deref(), Some("Reader"));
        assert_eq!(reloaded.session.max_body_size, 128);
        assert_eq!(reloaded.session.write_type, WriteType::WithResponse);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = Config::default();
        assert!(config.set("requested_mtu", "1000").is_err());
        assert!(config.set("max_body_size", "abc").is_err());
        assert!(config.set("no_such_key", "1").is_err());
        assert_eq!(config.get("no_such_key"), None);
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"scan_timeout_secs": 3, "session": {"max_body_size": 64}}"#)
            .expect("write");

        let config = Config::load_from(&path).expect("load");
        assert_eq!(config.scan_timeout_secs, 3);
        assert_eq!(config.session.max_body_size, 64);
        assert_eq!(config.ready_timeout_secs, 15);
        assert!(config.session.read_on_ready);
    }
}
