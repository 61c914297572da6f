//! SDK timing configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Malformed configuration: {0}")]
    Malformed(String),
}

/// Timeouts and delays used by sessions and the device registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SdkConfig {
    /// Idle sessions without a liveness signal for this long become Lost
    pub node_lost_timeout_ms: u64,
    /// Delay before retrying a transport operation
    pub retry_delay_ms: u64,
    /// Default discovery duration; 0 scans until stopped
    pub discovery_timeout_ms: u64,
    /// Default wait for an awaited command response
    pub command_timeout_ms: u64,
}

impl Default for SdkConfig {
    fn default() -> Self {
        Self {
            node_lost_timeout_ms: 2000,
            retry_delay_ms: 100,
            discovery_timeout_ms: 10_000,
            command_timeout_ms: 2000,
        }
    }
}

impl SdkConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Malformed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_lost_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "node_lost_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.retry_delay_ms == 0 {
            return Err(ConfigError::Invalid("retry_delay_ms must be > 0".to_string()));
        }
        if self.command_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "command_timeout_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn node_lost_timeout(&self) -> Duration {
        Duration::from_millis(self.node_lost_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// `None` means discovery runs until stopped
    pub fn discovery_timeout(&self) -> Option<Duration> {
        (self.discovery_timeout_ms > 0).then(|| Duration::from_millis(self.discovery_timeout_ms))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}
