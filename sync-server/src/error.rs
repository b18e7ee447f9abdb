//! Error types for convsync-server.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::path::PathBuf;
use sync_types::SyncError;

/// Main error type for convsync-server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// IM engine error.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// Request failed validation before any side effect.
    #[error("{0}")]
    Validation(#[from] SyncError),

    /// Rate limit exceeded.
    #[error("rate limit exceeded: {reason}")]
    RateLimited {
        /// Reason for rate limiting.
        reason: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// HTTP status this error is reported with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Storage(_) | Self::Engine(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Config(_) | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<JsonRejection> for ServerError {
    fn from(rejection: JsonRejection) -> Self {
        Self::Validation(SyncError::InvalidData(rejection.body_text()))
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }
        let body = serde_json::json!({
            "status": status.as_u16(),
            "msg": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

/// Storage layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// Database path error.
    #[error("invalid database path: {path}")]
    InvalidPath {
        /// The invalid path.
        path: PathBuf,
    },

    /// A stored row could not be mapped back to a domain value.
    #[error("corrupt row in {table}: {reason}")]
    Corrupt {
        /// Table the row came from.
        table: &'static str,
        /// What was wrong with it.
        reason: String,
    },
}

/// IM engine collaborator errors.
///
/// All of these are transient from the caller's point of view: the client
/// retries the whole request.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The request never got a response.
    #[error("engine transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The engine answered with a non-success status.
    #[error("engine returned {status} for {path}: {body}")]
    Status {
        /// Engine path that was called.
        path: &'static str,
        /// HTTP status code.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },

    /// The engine's response body did not match the expected shape.
    #[error("engine response for {path} could not be decoded: {reason}")]
    Decode {
        /// Engine path that was called.
        path: &'static str,
        /// Decoder message.
        reason: String,
    },

    /// Scripted failure (mock engine).
    #[error("engine unavailable: {0}")]
    Unavailable(String),
}

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Result type alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Result type alias for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;
