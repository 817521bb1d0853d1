use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::DEFAULT_RELAYS;

/// scrypt cost used by NIP-49 when encrypting the stored key
pub const DEFAULT_SCRYPT_LOG_N: u8 = 16;

#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub data_dir: PathBuf,
    pub relays: Vec<String>,
    /// log2 of the scrypt work factor for key encryption at rest
    pub scrypt_log_n: u8,
    /// Upper bound for waiting on a background command's completion signal
    pub command_timeout: Duration,
}

impl CoreConfig {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            relays: DEFAULT_RELAYS.iter().map(|r| r.to_string()).collect(),
            scrypt_log_n: DEFAULT_SCRYPT_LOG_N,
            command_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_relays(mut self, relays: Vec<String>) -> Self {
        self.relays = relays;
        self
    }

    pub fn with_scrypt_log_n(mut self, log_n: u8) -> Self {
        self.scrypt_log_n = log_n;
        self
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("bija.sqlite")
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self::new("bija_data")
    }
}
