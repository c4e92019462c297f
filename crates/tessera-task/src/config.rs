//! Loader configuration

use crate::error::LoaderError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tessera_core::DiskCacheStrategy;

/// Default number of concurrently running retrieval tasks
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Default memory tier budget (64 MiB)
pub const DEFAULT_MEMORY_CAPACITY_BYTES: u64 = 64 * 1024 * 1024;

/// Default failure memo validity window
pub const DEFAULT_ERROR_TTL_SECS: u64 = 60;

/// Loader configuration, loadable from TOML
///
/// ```toml
/// pool_size = 8
/// memory_capacity_bytes = 134217728
/// disk_dir = "/var/cache/tessera"
/// error_ttl_secs = 30
/// default_strategy = "result"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoaderConfig {
    /// Worker pool size
    pub pool_size: usize,
    /// Memory tier budget in bytes
    pub memory_capacity_bytes: u64,
    /// Memory tier time-to-live, if entries should expire
    pub memory_ttl_secs: Option<u64>,
    /// Disk tier directory; no disk tier when absent
    pub disk_dir: Option<PathBuf>,
    /// Failure memo validity window
    pub error_ttl_secs: u64,
    /// Strategy for requests built through the loader
    pub default_strategy: DiskCacheStrategy,
    /// Decoder allocation ceiling
    pub decode_limit_bytes: Option<u64>,
}

impl LoaderConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate TOML text
    ///
    /// # Errors
    /// Returns error if the text is not valid TOML for this type or fails validation
    pub fn from_toml_str(text: &str) -> Result<Self, LoaderError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    ///
    /// # Errors
    /// Returns error if the file cannot be read or its contents are invalid
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LoaderError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| LoaderError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Check that the values can build a loader
    ///
    /// # Errors
    /// Returns `LoaderError::Config` describing the first invalid value
    pub fn validate(&self) -> Result<(), LoaderError> {
        if self.pool_size == 0 {
            return Err(LoaderError::Config(
                "pool_size must be at least 1".to_string(),
            ));
        }
        if self.memory_capacity_bytes == 0 {
            return Err(LoaderError::Config(
                "memory_capacity_bytes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// With worker pool size
    #[inline]
    #[must_use]
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// With memory tier budget
    #[inline]
    #[must_use]
    pub fn with_memory_capacity(mut self, bytes: u64) -> Self {
        self.memory_capacity_bytes = bytes;
        self
    }

    /// With memory tier time-to-live
    #[inline]
    #[must_use]
    pub fn with_memory_ttl(mut self, ttl: Duration) -> Self {
        self.memory_ttl_secs = Some(ttl.as_secs());
        self
    }

    /// With disk tier directory
    #[inline]
    #[must_use]
    pub fn with_disk_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.disk_dir = Some(dir.into());
        self
    }

    /// With failure memo validity window
    #[inline]
    #[must_use]
    pub fn with_error_ttl(mut self, ttl: Duration) -> Self {
        self.error_ttl_secs = ttl.as_secs();
        self
    }

    /// With default disk strategy
    #[inline]
    #[must_use]
    pub fn with_default_strategy(mut self, strategy: DiskCacheStrategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    /// With decoder allocation ceiling
    #[inline]
    #[must_use]
    pub fn with_decode_limit(mut self, bytes: u64) -> Self {
        self.decode_limit_bytes = Some(bytes);
        self
    }

    /// Failure memo validity window
    #[must_use]
    pub fn error_ttl(&self) -> Duration {
        Duration::from_secs(self.error_ttl_secs)
    }

    /// Memory tier time-to-live
    #[must_use]
    pub fn memory_ttl(&self) -> Option<Duration> {
        self.memory_ttl_secs.map(Duration::from_secs)
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            memory_capacity_bytes: DEFAULT_MEMORY_CAPACITY_BYTES,
            memory_ttl_secs: None,
            disk_dir: None,
            error_ttl_secs: DEFAULT_ERROR_TTL_SECS,
            default_strategy: DiskCacheStrategy::All,
            decode_limit_bytes: None,
        }
    }
}
