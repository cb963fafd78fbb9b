//! Subscription cache error types.

use thiserror::Error;

/// Error type for subscription cache operations.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    /// A connection with the given id is already tracked by the cache.
    #[error("connection '{0}' already exists in the cache")]
    ConnectionAlreadyExists(String),

    /// A subscription with the given id already exists on the connection.
    #[error("subscription '{1}' for connection '{0}' already exists in the cache")]
    SubscriptionAlreadyExists(String, String),

    /// No connection with the given id is tracked by the cache.
    #[error("connection '{0}' does not exist in the cache")]
    ConnectionNotFound(String),

    /// Redis transport error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Serialization/deserialization error for a persisted blob.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SubscriptionError {
    /// Returns true if this error indicates a missing connection.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SubscriptionError::ConnectionNotFound(_))
    }

    /// Returns true if this error indicates a duplicate connection or subscription.
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            SubscriptionError::ConnectionAlreadyExists(_)
                | SubscriptionError::SubscriptionAlreadyExists(_, _)
        )
    }
}

/// Result type for subscription cache operations.
pub type Result<T> = std::result::Result<T, SubscriptionError>;
