//! Kernel configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::CacheConfig;
use crate::driver::DriverConfig;
use crate::error::{FsError, FsResult};
use crate::pool::PoolConfig;

/// Everything needed to build a kernel besides the driver implementations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Buffer pool settings.
    pub pool: PoolConfig,
    /// Entry cache settings.
    pub cache: CacheConfig,
    /// Registered schemes.
    pub drivers: Vec<DriverConfig>,
    /// Sync with `UMOUNT` when the kernel is dropped.
    pub sync_on_drop: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            cache: CacheConfig::default(),
            drivers: Vec::new(),
            sync_on_drop: true,
        }
    }
}

impl KernelConfig {
    /// Parses a JSON document.
    pub fn from_json(text: &str) -> FsResult<Self> {
        serde_json::from_str(text).map_err(|e| FsError::Config(format!("invalid kernel config: {}", e)))
    }

    /// Reads and parses a JSON file.
    pub fn load(path: impl AsRef<Path>) -> FsResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_json(&text)?;
        debug!("config: loaded {} with {} driver(s)", path.display(), config.drivers.len());
        Ok(config)
    }

    /// Serializes to pretty JSON.
    pub fn to_json(&self) -> FsResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| FsError::Config(e.to_string()))
    }
}
