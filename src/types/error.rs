//! Unified error types for the cache layer
//!
//! Storage, configuration and remote failures all funnel into [`CacheError`].
//! None of them is fatal to the process: callers narrow the capability (cache
//! disabled for one account) or defer the work (offline queue).

use thiserror::Error;

use crate::backend::RemoteError;

/// Cache layer error type
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Storage unavailable for {account}: {message}")]
    StorageUnavailable { account: String, message: String },

    #[error("Storage handle is closed: {0}")]
    Closed(String),

    #[error("Cache is disabled")]
    CacheDisabled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    Other(String),
}

impl From<rusqlite::Error> for CacheError {
    fn from(e: rusqlite::Error) -> Self {
        CacheError::Database(e.to_string())
    }
}

impl From<r2d2::Error> for CacheError {
    fn from(e: r2d2::Error) -> Self {
        CacheError::Database(e.to_string())
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for CacheError {
    fn from(err: toml::de::Error) -> Self {
        CacheError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for CacheError {
    fn from(err: toml::ser::Error) -> Self {
        CacheError::Config(err.to_string())
    }
}

/// Result type alias using CacheError
pub type Result<T> = std::result::Result<T, CacheError>;
