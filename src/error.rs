use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::ValidationError;
use crate::store::StoreError;

// ============================================================================
// Collaborator failures
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Timeout,
    RateLimited,
    ServerError,
    ClientError,
    NotFound,
    Unknown,
}

impl ErrorCategory {
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCategory::Network
                | ErrorCategory::Timeout
                | ErrorCategory::RateLimited
                | ErrorCategory::ServerError
                | ErrorCategory::Unknown
        )
    }

    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Network => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::RateLimited => "RATE_LIMITED",
            Self::ServerError => "SERVER_ERROR",
            Self::ClientError => "CLIENT_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Unknown => "UNKNOWN_ERROR",
        }
    }
}

/// Error reported by one of the external collaborators (upload transport,
/// item creation, item read).
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("[{}] {message}", category.code())]
pub struct ServiceError {
    pub category: ErrorCategory,
    pub message: String,
    pub status: Option<u16>,
}

impl ServiceError {
    const MAX_MESSAGE_LENGTH: usize = 512;

    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        let mut message = message.into();
        truncate_utf8_safe(&mut message, Self::MAX_MESSAGE_LENGTH);
        Self {
            category,
            message,
            status: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Timeout, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::NotFound, message)
    }

    /// Classifies an HTTP status the way the REST client reports it.
    #[must_use]
    pub fn from_http_status(status: u16, body: Option<&[u8]>) -> Self {
        let category = match status {
            404 => ErrorCategory::NotFound,
            408 => ErrorCategory::Timeout,
            429 => ErrorCategory::RateLimited,
            400..=499 => ErrorCategory::ClientError,
            500..=599 => ErrorCategory::ServerError,
            _ => ErrorCategory::Unknown,
        };

        let message = body
            .and_then(|b| serde_json::from_slice::<ApiErrorBody>(b).ok())
            .map(|e| e.message)
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| format!("HTTP error: {status}"));

        let mut error = Self::new(category, message);
        error.status = Some(status);
        error
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.category.is_retryable()
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
}

// ============================================================================
// Pipeline entry point errors
// ============================================================================

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid upload: {0}")]
    Validation(#[from] ValidationError),

    #[error("task store rejected the upload: {0}")]
    Store(#[from] StoreError),

    #[error("no async runtime available to drive the upload")]
    Runtime,
}

pub type PipelineResult<T> = Result<T, PipelineError>;

pub(crate) fn truncate_utf8_safe(s: &mut String, max_bytes: usize) {
    if s.len() <= max_bytes {
        return;
    }

    let mut truncate_at = max_bytes;
    while truncate_at > 0 && !s.is_char_boundary(truncate_at) {
        truncate_at -= 1;
    }
    s.truncate(truncate_at);
}
