//! Panel configuration loaded from TOML

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;
use crate::rmd::FirmwareProfile;

/// Default tracing filter when neither the config nor `RUST_LOG` sets one
pub const DEFAULT_LOG_FILTER: &str = "rmd_panel=debug,info";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelConfig {
    /// Bus instance of the actuator
    pub instance: u8,
    /// Built-in firmware profile name
    pub profile: String,
    /// Profile TOML file; overrides `profile` when set
    pub profile_path: Option<String>,
    /// Mark the link lost after this long without a `connected` report
    /// (0 disables the check)
    pub link_timeout_ms: u64,
    /// Tracing filter directive
    pub log_filter: String,
    /// Allow writing the RMD baudrate preset
    pub enable_baudrate_write: bool,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            instance: 0,
            profile: "rmd-x".to_string(),
            profile_path: None,
            link_timeout_ms: 500,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            enable_baudrate_write: false,
        }
    }
}

impl PanelConfig {
    pub fn from_toml_str(text: &str, origin: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text, &path.display().to_string())
    }

    pub fn link_timeout(&self) -> Option<Duration> {
        (self.link_timeout_ms > 0).then(|| Duration::from_millis(self.link_timeout_ms))
    }

    /// Resolve the firmware profile this config selects
    pub fn firmware_profile(&self) -> Result<FirmwareProfile, ConfigError> {
        let Some(path) = &self.profile_path else {
            return Ok(FirmwareProfile::builtin(&self.profile)?);
        };

        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let profile = FirmwareProfile::from_toml_str(&text)?;
        info!("Loaded firmware profile {} from {}", profile.name, path);
        Ok(profile)
    }
}
