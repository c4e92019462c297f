//! Error types for Tessera task orchestration
//!
//! Request-scoped failures are [`tessera_core::LoadFailure`] values delivered
//! to targets. The errors here cover everything around a request: building a
//! loader, reading its configuration, and state-machine bookkeeping.

use crate::state::TaskState;
use std::path::PathBuf;
use tessera_cache::DiskError;

/// Loader construction and configuration errors
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    /// Configuration file could not be read
    #[error("io error reading {path}: {source}")]
    ConfigIo {
        /// Config file path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Configuration text is not valid TOML for a loader
    #[error("invalid configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Configuration values are inconsistent
    #[error("configuration error: {0}")]
    Config(String),

    /// Disk tier could not be opened or maintained
    #[error("disk cache error: {0}")]
    Disk(#[from] DiskError),
}

/// State machine errors
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Transition not allowed from the current state
    #[error("illegal transition: {from} -> {to}")]
    IllegalTransition {
        /// Current state
        from: TaskState,
        /// Requested state
        to: TaskState,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_error_display() {
        let err = StateError::IllegalTransition {
            from: TaskState::Created,
            to: TaskState::Done,
        };
        assert_eq!(err.to_string(), "illegal transition: CREATED -> DONE");
    }

    #[test]
    fn config_error_display() {
        let err = LoaderError::Config("pool_size must be at least 1".to_string());
        assert_eq!(
            err.to_string(),
            "configuration error: pool_size must be at least 1"
        );
    }
}
