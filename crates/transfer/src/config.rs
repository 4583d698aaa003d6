//! Transfer settings.
//!
//! Read from `<config dir>/cdndrive/config.json`; every field is optional
//! and falls back to the defaults below.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{DEFAULT_BLOCK_SIZE, MAX_ATTEMPTS, TransferError};

/// Tunables shared by uploads and downloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Workers per pool (download: one pool, upload: one pool per driver).
    pub concurrency: usize,
    /// Block size used when planning uploads.
    pub block_size: u64,
    /// Rewrite `http://` to `https://` before every fetch.
    pub force_https: bool,
    /// Attempts per block (and per meta upload) before giving up.
    pub max_attempts: u32,
    /// Deadline for one block or meta fetch.
    pub fetch_timeout_secs: u64,
    /// Deadline for one driver upload call.
    pub upload_timeout_secs: u64,
    /// Directory downloads are written into.
    pub output_dir: PathBuf,
    /// Re-hash an existing full-size destination before calling it complete.
    pub verify_existing: bool,
    /// Seed for source selection. `None` seeds from the OS.
    pub rng_seed: Option<u64>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            block_size: DEFAULT_BLOCK_SIZE,
            force_https: false,
            max_attempts: MAX_ATTEMPTS,
            fetch_timeout_secs: 30,
            upload_timeout_secs: 60,
            output_dir: PathBuf::from("."),
            verify_existing: true,
            rng_seed: None,
        }
    }
}

impl TransferConfig {
    /// Loads a config file.
    ///
    /// A missing file yields the defaults; so does an unparseable one, with
    /// a warning.
    pub fn load(path: &Path) -> Result<Self, TransferError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        match serde_json::from_str::<Self>(&content) {
            Ok(config) => {
                config.validate()?;
                Ok(config)
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse transfer config, using defaults"
                );
                Ok(Self::default())
            }
        }
    }

    /// Rejects settings no transfer can run with.
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.concurrency == 0 {
            return Err(TransferError::InvalidConfig("concurrency must be at least 1".into()));
        }
        if self.block_size == 0 {
            return Err(TransferError::InvalidConfig("block size must be positive".into()));
        }
        if self.max_attempts == 0 {
            return Err(TransferError::InvalidConfig("max attempts must be at least 1".into()));
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }
}

/// Default config file location.
pub fn default_config_path() -> Option<PathBuf> {
    cdndrive_driver::config_dir().map(|d| d.join("cdndrive").join("config.json"))
}
