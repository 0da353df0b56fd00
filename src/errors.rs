use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// Structured classification of every failure the upload pipeline can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    AuthFailure,
    Upstream,
    Transfer,
    PayloadTooLarge,
    StrategyExhausted,
    Assembly,
    Metadata,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::AuthFailure => "auth_failure",
            ErrorKind::Upstream => "upstream",
            ErrorKind::Transfer => "transfer",
            ErrorKind::PayloadTooLarge => "payload_too_large",
            ErrorKind::StrategyExhausted => "strategy_exhausted",
            ErrorKind::Assembly => "assembly",
            ErrorKind::Metadata => "metadata",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("invalid upload request: {0}")]
    Validation(String),
    #[error("storage authorization failed: {0}")]
    AuthFailure(String),
    #[error("storage backend rejected the request: {0}")]
    Upstream(String),
    #[error("transfer failed: {0}")]
    Transfer(String),
    #[error("payload of {size} bytes exceeds the {limit} byte transfer limit")]
    PayloadTooLarge { size: u64, limit: u64 },
    #[error("no upload strategy can carry {size} bytes (relay ceiling is {ceiling} bytes)")]
    StrategyExhausted { size: u64, ceiling: u64 },
    #[error("multipart assembly rejected: {0}")]
    Assembly(String),
    #[error("`{path}` was uploaded but its file record could not be written: {reason}")]
    Metadata { path: String, reason: String },
}

pub type UploadResult<T> = Result<T, UploadError>;

impl UploadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            UploadError::Validation(_) => ErrorKind::Validation,
            UploadError::AuthFailure(_) => ErrorKind::AuthFailure,
            UploadError::Upstream(_) => ErrorKind::Upstream,
            UploadError::Transfer(_) => ErrorKind::Transfer,
            UploadError::PayloadTooLarge { .. } => ErrorKind::PayloadTooLarge,
            UploadError::StrategyExhausted { .. } => ErrorKind::StrategyExhausted,
            UploadError::Assembly(_) => ErrorKind::Assembly,
            UploadError::Metadata { .. } => ErrorKind::Metadata,
        }
    }

    /// HTTP status used when this error crosses the server boundary.
    pub fn status(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::AuthFailure | ErrorKind::Upstream | ErrorKind::Transfer => {
                StatusCode::BAD_GATEWAY
            }
            ErrorKind::PayloadTooLarge | ErrorKind::StrategyExhausted => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            ErrorKind::Assembly => StatusCode::CONFLICT,
            ErrorKind::Metadata => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Rebuild an error from the `kind` and `error` fields of a server response.
    ///
    /// Size-carrying variants lose their numbers on the wire, so they come back
    /// with whatever the caller knows about the payload.
    pub fn from_wire(kind: ErrorKind, message: String, size: u64, limit: u64) -> Self {
        match kind {
            ErrorKind::Validation => UploadError::Validation(message),
            ErrorKind::AuthFailure => UploadError::AuthFailure(message),
            ErrorKind::Upstream => UploadError::Upstream(message),
            ErrorKind::Transfer => UploadError::Transfer(message),
            ErrorKind::PayloadTooLarge => UploadError::PayloadTooLarge { size, limit },
            ErrorKind::StrategyExhausted => UploadError::StrategyExhausted {
                size,
                ceiling: limit,
            },
            ErrorKind::Assembly => UploadError::Assembly(message),
            ErrorKind::Metadata => UploadError::Metadata {
                path: String::new(),
                reason: message,
            },
        }
    }
}

impl From<sqlx::Error> for UploadError {
    fn from(err: sqlx::Error) -> Self {
        UploadError::Upstream(format!("database error: {err}"))
    }
}

impl From<std::io::Error> for UploadError {
    fn from(err: std::io::Error) -> Self {
        UploadError::Transfer(format!("i/o error: {err}"))
    }
}

/// A lightweight wrapper for errors returned by HTTP handlers.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub kind: Option<ErrorKind>,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            kind: None,
            message: msg.into(),
        }
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    /// Shortcut for 401 Unauthorized
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "kind": self.kind,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        Self {
            status: err.status(),
            kind: Some(err.kind()),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_distinct_statuses_for_terminal_classes() {
        let transfer = UploadError::Transfer("reset".into());
        let metadata = UploadError::Metadata {
            path: "a/root/1-x".into(),
            reason: "db down".into(),
        };
        assert_eq!(transfer.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(metadata.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_ne!(transfer.kind(), metadata.kind());
    }

    #[test]
    fn wire_kind_names_round_trip_through_serde() {
        let encoded = serde_json::to_string(&ErrorKind::StrategyExhausted).unwrap();
        assert_eq!(encoded, "\"strategy_exhausted\"");
        let decoded: ErrorKind = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, ErrorKind::StrategyExhausted);
    }

    #[test]
    fn exhausted_message_carries_the_offending_size() {
        let err = UploadError::StrategyExhausted {
            size: 7_340_032,
            ceiling: 6_291_456,
        };
        assert!(err.to_string().contains("7340032"));
    }
}
