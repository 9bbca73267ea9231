//! Error types for adrelay
//!
//! Cache backend failures are reported through this type by the raw
//! [`CacheStore`](crate::storage::CacheStore) implementations, but the
//! higher-level wrappers never let them escape: they degrade to a miss,
//! a dropped write or a no-op delete.

use thiserror::Error;

/// Result alias used throughout the library
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors produced by the cache and token resolution layer
#[derive(Debug, Error)]
pub enum RelayError {
    /// The cache backend rejected a command or could not be reached
    #[error("Cache error: {0}")]
    Cache(String),

    /// Cached bytes could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration (bad environment value, inverted TTLs)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Input rejected before any work was done
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A caller-supplied fetch against the upstream API failed
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// The upstream API answered with a non-success status
    #[error("Upstream error: {message}")]
    UpstreamStatus { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    pub fn cache(msg: impl Into<String>) -> Self {
        Self::Cache(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream(msg.into())
    }

    pub fn upstream_status(status: u16, msg: impl Into<String>) -> Self {
        Self::UpstreamStatus {
            status,
            message: msg.into(),
        }
    }

    /// Whether the upstream refused the token itself (401/403)
    pub fn is_token_rejected(&self) -> bool {
        matches!(self, Self::UpstreamStatus { status: 401 | 403, .. })
    }
}

impl From<redis::RedisError> for RelayError {
    fn from(e: redis::RedisError) -> Self {
        Self::Cache(e.to_string())
    }
}

impl From<deadpool_redis::PoolError> for RelayError {
    fn from(e: deadpool_redis::PoolError) -> Self {
        Self::Cache(format!("Failed to get Redis connection: {}", e))
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
