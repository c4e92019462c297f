//! Error types for the cache tiers

use std::path::PathBuf;

/// Errors from the disk tier
#[derive(Debug, thiserror::Error)]
pub enum DiskError {
    /// IO error on a cache entry or directory
    #[error("io error on {path}: {source}")]
    Io {
        /// Entry or directory path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Entry serialization failed
    #[error("entry encoding failed: {0}")]
    Encode(String),
}

impl DiskError {
    /// Create IO error for path
    pub fn io_error(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
