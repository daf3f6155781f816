use std::time::Duration;

use shared::error::{ApiError, ErrorCode};
use thiserror::Error;

pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// Structured failure surfaced by the engine.
///
/// `Clone` so that a single coalesced fetch can hand the same failure to
/// every waiting caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("service busy: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("no session is loaded")]
    NoActiveSession,
    #[error("malformed payload: {0}")]
    Protocol(String),
    #[error("durable store failure: {0}")]
    Storage(String),
}

impl SyncError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    /// Whether a bounded retry may succeed. Validation, not-found and auth
    /// failures are final from the caller's point of view.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Connection(_) | Self::Server { .. }
        )
    }

    pub fn is_service_busy(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Maps an HTTP status and optional error body onto the taxonomy.
    pub fn from_status(status: u16, body: Option<ApiError>, retry_after: Option<Duration>) -> Self {
        let message = body
            .as_ref()
            .map(|body| body.message.clone())
            .unwrap_or_else(|| format!("request failed with status {status}"));
        match status {
            401 => Self::Auth(message),
            404 => Self::NotFound(message),
            429 => Self::RateLimited {
                message,
                retry_after,
            },
            500..=599 => Self::Server { status, message },
            _ => match body.map(|body| body.code) {
                Some(ErrorCode::Unauthorized) => Self::Auth(message),
                Some(ErrorCode::NotFound) => Self::NotFound(message),
                Some(ErrorCode::RateLimited) => Self::RateLimited {
                    message,
                    retry_after,
                },
                _ => Self::Validation(message),
            },
        }
    }
}

impl From<ApiError> for SyncError {
    fn from(value: ApiError) -> Self {
        match value.code {
            ErrorCode::Unauthorized | ErrorCode::Forbidden => Self::Auth(value.message),
            ErrorCode::NotFound => Self::NotFound(value.message),
            ErrorCode::Validation => Self::Validation(value.message),
            ErrorCode::RateLimited => Self::RateLimited {
                message: value.message,
                retry_after: None,
            },
            ErrorCode::Internal | ErrorCode::Unknown => Self::Server {
                status: 500,
                message: value.message,
            },
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_decode() {
            return Self::Protocol(value.to_string());
        }
        if let Some(status) = value.status() {
            return Self::from_status(status.as_u16(), None, None);
        }
        Self::Connection(value.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(value: serde_json::Error) -> Self {
        Self::Protocol(value.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for SyncError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::Connection("request timed out".to_string())
    }
}
