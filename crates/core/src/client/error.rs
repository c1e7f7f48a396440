//! Transport error taxonomy for completion calls.

use thiserror::Error;

/// Errors surfaced by a completion backend
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LlmError {
    #[error("network error: {message}")]
    Network { message: String },

    #[error("request timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("rate limited: {message}")]
    RateLimited { message: String },

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("authentication failed: {message}")]
    Authentication { message: String },

    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("failed to parse response: {message}")]
    Parse { message: String },

    #[error("API key not configured (set {env_var})")]
    MissingApiKey { env_var: String },
}

impl LlmError {
    /// Transient failures worth another attempt: rate limits, 5xx, timeouts,
    /// dropped connections.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::Network { .. }
                | LlmError::Timeout { .. }
                | LlmError::RateLimited { .. }
                | LlmError::Server { .. }
        )
    }

    /// Map a non-success HTTP status and body to an error
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 | 403 => LlmError::Authentication {
                message: format!("HTTP {}: {}", status, body),
            },
            408 => LlmError::Network {
                message: format!("HTTP 408: {}", body),
            },
            429 => LlmError::RateLimited {
                message: body.to_string(),
            },
            // 529 is the backend's "overloaded" status
            500..=599 => LlmError::Server {
                status,
                message: body.to_string(),
            },
            _ => LlmError::InvalidRequest {
                message: format!("HTTP {}: {}", status, body),
            },
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return LlmError::from_status(status.as_u16(), &err.to_string());
        }
        LlmError::Network {
            message: err.to_string(),
        }
    }
}
