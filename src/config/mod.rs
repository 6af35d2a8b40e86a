use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::core::bluetooth::{
    DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_NAME_PATTERNS, DEFAULT_POLL_INTERVAL_MS,
    DEFAULT_SCAN_TIMEOUT_MS,
};
use crate::utils::write_file_atomically;

pub const CONFIG_FILE_NAME: &str = "connectivity.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    /// Case-sensitive substrings a bike's advertised name must contain.
    pub name_patterns: Vec<String>,

    /// Keep-alive poll cadence.
    pub poll_interval_ms: u64,

    /// Upper bound on connect plus GATT discovery.
    pub connect_timeout_ms: u64,

    /// How long a scan may run before the first matching device shows up.
    pub scan_timeout_ms: u64,

    /// Default log level when RUST_LOG is not set.
    pub log_level: String,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        ConnectivityConfig {
            name_patterns: DEFAULT_NAME_PATTERNS.iter().map(|p| p.to_string()).collect(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            scan_timeout_ms: DEFAULT_SCAN_TIMEOUT_MS,
            log_level: "info".to_string(),
        }
    }
}

impl ConnectivityConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    /// Loads the config from a configuration file, falling back to defaults
    /// when the file does not exist.
    pub async fn load_config(file_path: &Path) -> Result<Self> {
        if !file_path.exists() {
            warn!("Config file not found at {:?}, using default.", file_path);
            return Ok(Self::default());
        }

        let config_json = fs::read_to_string(file_path).await?;
        let config: Self = serde_json::from_str(&config_json)?;

        info!("Config loaded from {:?}", file_path);
        Ok(config)
    }

    /// Saves the current config to a configuration file.
    pub async fn save_config(&self, file_path: &Path) -> Result<()> {
        let config_json = match serde_json::to_string_pretty(&self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize connectivity config to JSON: {}", e);
                return Err(e.into());
            }
        };

        write_file_atomically(file_path, config_json).await?;

        info!("Connectivity config saved to {:?}.", file_path);
        Ok(())
    }
}
