//! Cache error types.

use thiserror::Error;

/// Cache error type.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Redis connection or command error.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A stored entry could not be (de)serialized.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;
