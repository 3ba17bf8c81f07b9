//! Control-plane error kinds and their wire representation.
//!
//! Transport problems are retried inside the HTTP layer and only surface
//! as `Unavailable` once retries are exhausted. Business errors cross the
//! API unchanged. Persistence errors never appear here at all — the
//! persister logs and swallows them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    /// Unknown party or peer id.
    #[error("party or peer does not exist")]
    NotFound,

    /// Validation failure: bad nat_type, malformed id.
    #[error("invalid request: {0}")]
    Invalid(String),

    /// Missing, expired, or mismatched token.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Duplicate create.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Network failure after all retries.
    #[error("control server unavailable: {0}")]
    Unavailable(String),

    /// Server-side failure (5xx, disk I/O).
    #[error("server error: {0}")]
    Server(String),

    /// Shutdown or timeout interrupted the operation.
    #[error("operation cancelled")]
    Cancelled,
}

impl ControlError {
    /// Wire code used in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ControlError::NotFound => "not_found",
            ControlError::Invalid(_) => "invalid",
            ControlError::Auth(_) => "auth",
            ControlError::Conflict(_) => "conflict",
            ControlError::Unavailable(_) => "unavailable",
            ControlError::Server(_) => "server",
            ControlError::Cancelled => "cancelled",
        }
    }

    /// Rebuild an error from a wire code + message.
    pub fn from_wire(code: &str, message: String) -> Self {
        match code {
            "not_found" => ControlError::NotFound,
            "invalid" => ControlError::Invalid(message),
            "auth" => ControlError::Auth(message),
            "conflict" => ControlError::Conflict(message),
            "unavailable" => ControlError::Unavailable(message),
            _ => ControlError::Server(message),
        }
    }
}

pub type Result<T> = std::result::Result<T, ControlError>;

impl From<serde_json::Error> for ControlError {
    fn from(e: serde_json::Error) -> Self {
        ControlError::Invalid(format!("serialization failed: {e}"))
    }
}

impl From<reqwest::Error> for ControlError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            ControlError::Unavailable(e.to_string())
        } else {
            ControlError::Server(e.to_string())
        }
    }
}

/// JSON error envelope: `{"error": {"code": "...", "message": "..."}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

impl ErrorBody {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                code: code.to_string(),
                message: message.into(),
            },
        }
    }
}

impl From<&ControlError> for ErrorBody {
    fn from(err: &ControlError) -> Self {
        ErrorBody::new(err.code(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrip() {
        let err = ControlError::Conflict("party exists".into());
        let body = ErrorBody::from(&err);
        assert_eq!(body.error.code, "conflict");
        let back = ControlError::from_wire(&body.error.code, body.error.message);
        assert!(matches!(back, ControlError::Conflict(_)));
    }

    #[test]
    fn unknown_code_maps_to_server() {
        let err = ControlError::from_wire("wat", "huh".into());
        assert!(matches!(err, ControlError::Server(_)));
    }
}
