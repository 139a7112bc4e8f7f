//! Error types for the dlchan core library.
//!
//! Uses `thiserror` for public API error types. Store corruption is never an
//! error (it is healed on the next write); only I/O on the write path, lock
//! acquisition and serialization failures surface here.

use std::path::PathBuf;

/// Errors from the file-backed stores (run queue, score table, history).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not acquire lock {path}: {message}")]
    Lock { path: PathBuf, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn lock(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Lock {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {0}")]
    Parse(#[from] Box<figment::Error>),
}
