//! Application configuration management.
//!
//! Configuration holds the API endpoint, renewal timing and the storage
//! backend for the persisted session, plus the last identifier used to log in.
//!
//! Configuration is stored at `~/.config/sessionward/config.json`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::api::client::REQUEST_TIMEOUT_SECS;
use crate::auth::{SessionOptions, StorageBackend, DEFAULT_SAFETY_MARGIN};

/// Application name used for config directory paths
const APP_NAME: &str = "sessionward";

/// Config file name
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: Option<String>,
    pub safety_margin_secs: u64,
    pub request_timeout_secs: u64,
    pub end_session_timeout_secs: u64,
    pub storage: StorageBackend,
    pub last_identifier: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let session = SessionOptions::default();
        Self {
            api_base_url: None,
            safety_margin_secs: DEFAULT_SAFETY_MARGIN.as_secs(),
            request_timeout_secs: REQUEST_TIMEOUT_SECS,
            end_session_timeout_secs: session.end_session_timeout.as_secs(),
            storage: StorageBackend::default(),
            last_identifier: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            safety_margin: Duration::from_secs(self.safety_margin_secs),
            end_session_timeout: Duration::from_secs(self.end_session_timeout_secs),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
