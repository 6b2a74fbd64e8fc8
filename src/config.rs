//! Run configuration
//!
//! Loaded from an optional TOML file; every field falls back to
//! `provision_shared::defaults`.
//!
//! ```toml
//! [device]
//! username = "phonecontrol"
//! password = "phonecontrol"
//! call_timeout_ms = 3000
//! pause_ms = 1500
//!
//! [dispatch]
//! chunk_size = 20
//!
//! [store]
//! backend = "sqlite"
//! path = "phonedb.sqlite"
//! ```

use crate::store::StoreConfig;
use provision_shared::defaults;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Errors while reading or validating the configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to parse config TOML: {source}")]
    Parse {
        #[from]
        source: toml::de::Error,
    },

    #[error("Failed to read config file '{path}': {source}")]
    Io {
        source: std::io::Error,
        path: String,
    },

    #[error("Config validation error: {message}")]
    Validation { message: String },
}

/// How phones are contacted
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    pub username: String,
    pub password: String,
    /// Connect/read timeout of a single call
    pub call_timeout_ms: u64,
    /// Pause after each keypress
    pub pause_ms: u64,
    /// Do not pause after the last keypress of a sequence
    pub skip_final_pause: bool,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            username: defaults::USERNAME.into(),
            password: defaults::PASSWORD.into(),
            call_timeout_ms: defaults::CALL_TIMEOUT_MS,
            pause_ms: defaults::PAUSE_MS,
            skip_final_pause: true,
        }
    }
}

impl DeviceSettings {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn pause(&self) -> Duration {
        Duration::from_millis(self.pause_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    /// Phones dispatched together; also the bound on in-flight phones
    pub chunk_size: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            chunk_size: defaults::CHUNK_SIZE,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    pub device: DeviceSettings,
    pub dispatch: DispatchSettings,
    pub store: StoreConfig,
}

impl ProvisionConfig {
    /// Read and validate a TOML config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            source,
            path: path.display().to_string(),
        })?;
        let config = Self::from_toml_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatch.chunk_size == 0 {
            return Err(ConfigError::Validation {
                message: "dispatch.chunk_size must be at least 1".into(),
            });
        }
        if self.device.call_timeout_ms == 0 {
            return Err(ConfigError::Validation {
                message: "device.call_timeout_ms must be greater than 0".into(),
            });
        }
        if self.device.username.is_empty() {
            return Err(ConfigError::Validation {
                message: "device.username must not be empty".into(),
            });
        }
        Ok(())
    }
}
