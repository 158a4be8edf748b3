//! Cache configuration
//!
//! Configuration can be built in code, deserialized from TOML, or loaded
//! from a file. Every field has a default so partial configs are fine.

use crate::driver::DriverKind;
use crate::error::{CacheError, CacheResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Default maximum total cache size: 10 GiB
const DEFAULT_MAX_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// Default age after which an incomplete file counts as stalled: 24 hours
const DEFAULT_STALL_TIME_SECS: u64 = 86400;

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding the cached/incomplete/invalid/queue areas
    pub cache_dir: PathBuf,

    /// Which storage driver tracks entry metadata
    pub driver: DriverKind,

    /// Maximum total size of cached entries in bytes.
    /// Zero is a valid "cache nothing" policy: `prune` evicts everything.
    pub max_size: u64,

    /// Age in seconds after which an incomplete file is considered stalled
    pub stall_time_secs: u64,

    /// Append lifecycle events to `cache_dir/audit.log` as JSON lines
    pub audit_log: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            driver: DriverKind::Xattr,
            max_size: DEFAULT_MAX_SIZE,
            stall_time_secs: DEFAULT_STALL_TIME_SECS,
            audit_log: false,
        }
    }
}

/// Default cache directory (`~/.cache/imagestash` on Linux)
fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("imagestash")
}

impl CacheConfig {
    /// Create a configuration rooted at the given directory, defaults elsewhere
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file, using defaults if it doesn't exist
    pub fn load(path: &Path) -> CacheResult<Self> {
        if !path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .map_err(|e| CacheError::io(format!("reading config from {}", path.display()), e))?;

        Self::from_toml_str(&content).map_err(|e| CacheError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Parse configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// The configured stall threshold as a [`Duration`]
    pub fn stall_time(&self) -> Duration {
        Duration::from_secs(self.stall_time_secs)
    }
}
