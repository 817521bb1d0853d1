use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bija_core::CoreConfig;
use serde::{Deserialize, Serialize};

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:5000";

/// Server configuration that can be loaded from a JSON file
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CliConfig {
    /// Address the HTTP surface listens on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_addr: Option<String>,

    /// Directory holding the sqlite store and the log file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    /// Relay urls; an empty list keeps the reader offline
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relays: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub scrypt_log_n: Option<u8>,
}

impl CliConfig {
    /// Load config from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_json(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize config")
    }

    pub fn bind_addr(&self) -> String {
        self.bind_addr
            .clone()
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string())
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(default_data_dir)
    }

    /// Core settings with every unset field left at the core default
    pub fn core_config(&self) -> CoreConfig {
        let mut config = CoreConfig::new(self.data_dir());
        if let Some(relays) = &self.relays {
            config = config.with_relays(relays.clone());
        }
        if let Some(log_n) = self.scrypt_log_n {
            config = config.with_scrypt_log_n(log_n);
        }
        config
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("bija")
}
