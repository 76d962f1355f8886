//! Top-level error types for relaybot.

use std::sync::Arc;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("invalid turn state transition: {0}")]
    InvalidTransition(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {source}")]
    Load {
        path: String,
        source: Arc<std::io::Error>,
    },

    #[error("failed to parse config file {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// History storage errors.
///
/// `BackendUnavailable` and `Timeout` are recoverable: the storage layer
/// answers them by falling back to the local history file.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("durable backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("durable backend {operation} timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u128,
    },

    #[error("history file {path} is corrupt: {reason}")]
    CorruptState { path: String, reason: String },

    #[error("stored history for {user_id} could not be decoded: {reason}")]
    Decode { user_id: String, reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StorageError {
    /// Whether the failure means the durable backend could not be reached.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            StorageError::BackendUnavailable(_) | StorageError::Timeout { .. }
        )
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(error: sqlx::Error) -> Self {
        StorageError::BackendUnavailable(error.to_string())
    }
}

/// Upstream model invocation errors. Never retried within a request.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("model provider is not configured (missing API key)")]
    NotConfigured,

    #[error("model provider rejected the API key")]
    Unauthorized,

    #[error("model provider rate limit exceeded")]
    RateLimited,

    #[error("model request timed out")]
    Timeout,

    #[error("failed to reach model provider: {0}")]
    Connection(String),

    #[error("model provider returned HTTP {status}: {body}")]
    Provider { status: u16, body: String },

    #[error("model provider returned an empty response")]
    EmptyResponse,
}

impl ModelError {
    /// Explanation shown to the end user in place of a reply.
    pub fn user_message(&self) -> &'static str {
        match self {
            ModelError::NotConfigured => {
                "The AI service is not configured yet. Set OPENROUTER_API_KEY and restart the service."
            }
            ModelError::Unauthorized => {
                "I can't access the AI service because the API key is invalid or missing."
            }
            ModelError::RateLimited => {
                "I've hit the rate limit for AI requests. Please try again in a few minutes."
            }
            ModelError::Timeout | ModelError::Connection(_) => {
                "I'm having trouble connecting to my AI services right now. Please try again in a moment."
            }
            ModelError::Provider { .. } | ModelError::EmptyResponse => {
                "I encountered an error while processing your request. Please try again later."
            }
        }
    }
}

/// Rejected input. Raised before any history is touched.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("user_id must not be empty")]
    EmptyUserId,

    #[error("message text must not be empty")]
    EmptyMessage,
}
