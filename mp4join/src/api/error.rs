//! API error handling.
//!
//! Provides consistent error responses for the API.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::error::Error;

/// API error response body.
#[derive(Debug, Serialize)]
pub struct ApiErrorResponse {
    /// Error code for programmatic handling
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Additional error details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// API error type that can be converted to HTTP responses.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    /// Create a new API error.
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    /// Add details to the error.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Create a 400 Bad Request error.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    /// Create a 403 Forbidden error.
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "FORBIDDEN", message)
    }

    /// Create a 404 Not Found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    /// Create a 413 Payload Too Large error.
    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::new(StatusCode::PAYLOAD_TOO_LARGE, "PAYLOAD_TOO_LARGE", message)
    }

    /// Create a 500 Internal Server Error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }

    /// Create a 503 Service Unavailable error.
    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorResponse {
            code: self.code,
            message: self.message,
            details: self.details,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::NotFound { .. } => ApiError::not_found(err.to_string()),
            Error::WrongOwner { .. } => ApiError::forbidden(err.to_string()),
            Error::InvalidPartCount(_)
            | Error::QuotaExceeded { .. }
            | Error::UploadClosed { .. }
            | Error::PartOutOfRange { .. }
            | Error::PartUnavailable { .. }
            | Error::LengthRequired
            | Error::LengthMismatch { .. } => ApiError::bad_request(err.to_string()),
            Error::PayloadTooLarge { .. } => ApiError::payload_too_large(err.to_string()),
            Error::StreamCapacity { .. } | Error::OutputMissing { .. } => {
                ApiError::service_unavailable(err.to_string())
            }
            Error::Io(e) => {
                tracing::error!("IO error: {}", e);
                ApiError::internal("IO error occurred")
            }
            Error::Configuration(msg) => {
                tracing::error!("Configuration error: {}", msg);
                ApiError::internal("Configuration error")
            }
        }
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::path::PathBuf;

    #[test]
    fn test_api_error_creation() {
        let err = ApiError::not_found("job not found: abc");
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.code, "NOT_FOUND");
        assert_eq!(err.message, "job not found: abc");
    }

    #[test]
    fn test_api_error_with_details() {
        let err = ApiError::bad_request("invalid part")
            .with_details(serde_json::json!({"part": 9, "part_count": 4}));

        assert!(err.details.is_some());
    }

    #[test]
    fn test_from_domain_error_statuses() {
        let cases: Vec<(Error, StatusCode)> = vec![
            (
                Error::not_found("job", "123"),
                StatusCode::NOT_FOUND,
            ),
            (
                Error::WrongOwner {
                    id: "123".to_string(),
                },
                StatusCode::FORBIDDEN,
            ),
            (Error::InvalidPartCount(3), StatusCode::BAD_REQUEST),
            (Error::LengthRequired, StatusCode::BAD_REQUEST),
            (
                Error::PartOutOfRange {
                    part: 9,
                    part_count: 4,
                },
                StatusCode::BAD_REQUEST,
            ),
            (
                Error::PayloadTooLarge {
                    declared: 100,
                    max: 10,
                },
                StatusCode::PAYLOAD_TOO_LARGE,
            ),
            (
                Error::StreamCapacity { active: 10, max: 10 },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                Error::OutputMissing {
                    path: PathBuf::from("/out/x.mp4"),
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                Error::QuotaExceeded {
                    address: IpAddr::V4(Ipv4Addr::LOCALHOST),
                },
                StatusCode::BAD_REQUEST,
            ),
        ];
        for (domain, status) in cases {
            let api: ApiError = domain.into();
            assert_eq!(api.status, status, "{}", api.message);
        }
    }

    #[test]
    fn test_from_not_found_keeps_id_in_message() {
        let api: ApiError = Error::not_found("job", "deadbeef").into();
        assert!(api.message.contains("deadbeef"));
    }
}
