//! Gateway error types.

use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Subscription cache error.
    #[error("cache error: {0}")]
    Cache(#[from] subscription_cache::SubscriptionError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error (authorization collaborator).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The requester is not allowed to subscribe to the requested resources.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The subscribe request failed validation.
    #[error("invalid request: {}", .0.join("; "))]
    InvalidRequest(Vec<String>),

    /// Channel send error (client went away mid-write).
    #[error("channel send error")]
    ChannelSend,
}

impl GatewayError {
    /// Stable error code sent to clients in error frames.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Cache(e) if e.is_not_found() => "NOT_FOUND",
            GatewayError::Cache(e) if e.is_already_exists() => "ALREADY_EXISTS",
            GatewayError::Cache(_) => "CACHE_ERROR",
            GatewayError::Json(_) => "BAD_MESSAGE",
            GatewayError::Http(_) => "AUTH_UNAVAILABLE",
            GatewayError::Unauthorized(_) => "UNAUTHORIZED",
            GatewayError::InvalidRequest(_) => "INVALID_REQUEST",
            GatewayError::ChannelSend => "INTERNAL",
        }
    }
}

impl From<tokio::sync::mpsc::error::SendError<axum::extract::ws::Message>> for GatewayError {
    fn from(_: tokio::sync::mpsc::error::SendError<axum::extract::ws::Message>) -> Self {
        GatewayError::ChannelSend
    }
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
