//! API error types with HTTP status mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::error::Error;

/// API error type with HTTP status code mapping.
#[derive(Debug)]
pub enum ApiError {
    /// Disk or job not found (404).
    NotFound(String),
    /// Disk busy or job in the wrong state (409).
    Conflict(String),
    /// Bad request - invalid input (400).
    BadRequest(String),
    /// The emulator refused or could not be reached (502).
    BadGateway(String),
    /// Internal server error (500).
    Internal(String),
}

/// JSON error response body.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, "MONITOR_ERROR", msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg),
        };

        let body = Json(ErrorResponse {
            error: message,
            code,
        });

        (status, body).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let message = err.to_string();
        match err {
            Error::NotFound(_) | Error::NoJob { .. } => ApiError::NotFound(message),
            Error::JobBusy { .. } | Error::NotReady { .. } | Error::GuestInactive(_) => {
                ApiError::Conflict(message)
            }
            Error::Unsupported(_)
            | Error::Overflow { .. }
            | Error::InvalidArgument(_)
            | Error::NoBackingFile(_) => ApiError::BadRequest(message),
            Error::MonitorRejected { .. } | Error::Monitor(_) => ApiError::BadGateway(message),
            _ => ApiError::Internal(message),
        }
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        ApiError::Internal(format!("task failed: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_status_codes() {
        let cases = [
            (ApiError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (ApiError::Conflict("x".into()), StatusCode::CONFLICT),
            (ApiError::BadRequest("x".into()), StatusCode::BAD_REQUEST),
            (ApiError::BadGateway("x".into()), StatusCode::BAD_GATEWAY),
            (
                ApiError::Internal("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (error, expected) in cases {
            assert_eq!(error.into_response().status(), expected);
        }
    }

    #[test]
    fn test_engine_error_mapping() {
        let err = Error::NoJob { disk: "vda".into() };
        assert!(matches!(ApiError::from(err), ApiError::NotFound(_)));

        let err = Error::busy("vda", "job 'pull-vda' is already running");
        assert!(matches!(ApiError::from(err), ApiError::Conflict(_)));

        let err = Error::Overflow {
            value: u64::MAX,
            unit: "MiB/s",
        };
        assert!(matches!(ApiError::from(err), ApiError::BadRequest(_)));

        let err = Error::rejected("block-stream", "Device is busy");
        assert!(matches!(ApiError::from(err), ApiError::BadGateway(_)));

        let err = Error::PivotFailed {
            job: "copy-vda".into(),
            message: "I/O error".into(),
        };
        assert!(matches!(ApiError::from(err), ApiError::Internal(_)));
    }
}
