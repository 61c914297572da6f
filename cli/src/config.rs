// Configuration management for the BlueST CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/bluestsdk/config.json
// - Linux: ~/.config/bluestsdk/config.json
// - Windows: %APPDATA%\bluestsdk\config.json

use anyhow::{Context, Result};
use bluestsdk_core::SdkConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Index of the Bluetooth adapter to use
    pub adapter_index: usize,

    /// Scan duration in seconds (0 scans until interrupted)
    pub scan_timeout: u64,

    /// Directory for daily log files; console only when unset
    pub log_dir: Option<String>,

    /// Session timing passed to the SDK
    pub sdk: SdkConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            adapter_index: 0,
            scan_timeout: 10,
            log_dir: None,
            sdk: SdkConfig::default(),
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("bluestsdk");

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

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            config
                .sdk
                .validate()
                .context("Invalid SDK settings in config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "adapter_index" => {
                self.adapter_index = value.parse().context("Invalid adapter index")?;
            }
            "scan_timeout" => {
                self.scan_timeout = value.parse().context("Invalid number")?;
            }
            "log_dir" => {
                self.log_dir = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "node_lost_timeout_ms" => {
                self.sdk.node_lost_timeout_ms = value.parse().context("Invalid number")?;
            }
            "retry_delay_ms" => {
                self.sdk.retry_delay_ms = value.parse().context("Invalid number")?;
            }
            "discovery_timeout_ms" => {
                self.sdk.discovery_timeout_ms = value.parse().context("Invalid number")?;
            }
            "command_timeout_ms" => {
                self.sdk.command_timeout_ms = value.parse().context("Invalid number")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        self.sdk.validate().context("Rejected value")?;
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "adapter_index" => Some(self.adapter_index.to_string()),
            "scan_timeout" => Some(self.scan_timeout.to_string()),
            "log_dir" => self.log_dir.clone(),
            "node_lost_timeout_ms" => Some(self.sdk.node_lost_timeout_ms.to_string()),
            "retry_delay_ms" => Some(self.sdk.retry_delay_ms.to_string()),
            "discovery_timeout_ms" => Some(self.sdk.discovery_timeout_ms.to_string()),
            "command_timeout_ms" => Some(self.sdk.command_timeout_ms.to_string()),
            _ => None,
        }
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            ("adapter_index".to_string(), self.adapter_index.to_string()),
            ("scan_timeout".to_string(), format!("{}s", self.scan_timeout)),
            (
                "log_dir".to_string(),
                self.log_dir.clone().unwrap_or_else(|| "(console)".to_string()),
            ),
            (
                "node_lost_timeout_ms".to_string(),
                self.sdk.node_lost_timeout_ms.to_string(),
            ),
            ("retry_delay_ms".to_string(), self.sdk.retry_delay_ms.to_string()),
            (
                "discovery_timeout_ms".to_string(),
                self.sdk.discovery_timeout_ms.to_string(),
            ),
            (
                "command_timeout_ms".to_string(),
                self.sdk.command_timeout_ms.to_string(),
            ),
        ]
    }
}
