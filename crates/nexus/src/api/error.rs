//! API error types

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use nexus_ca::CaError;
use nexus_core::{CoreError, ProtocolError};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ApiError {
    /// Error code
    pub code: String,
    /// Error message
    pub message: String,
}

impl ApiError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Wrapper for API errors with status codes
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub error: ApiError,
}

impl AppError {
    fn with(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            error: ApiError::new(code, message),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::with(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::with(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::with(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::with(StatusCode::UNAUTHORIZED, "UNAUTHENTICATED", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::with(StatusCode::CONFLICT, "IDENTITY_CONFLICT", message)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(self.error)).into_response()
    }
}

impl From<CoreError> for AppError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::MachineNotFound(_)
            | CoreError::UserNotFound(_)
            | CoreError::GroupNotFound(_) => AppError::not_found(e.to_string()),
            _ => AppError::internal(e.to_string()),
        }
    }
}

impl From<CaError> for AppError {
    fn from(e: CaError) -> Self {
        if e.is_request_error() {
            AppError::bad_request(e.to_string())
        } else {
            AppError::internal(e.to_string())
        }
    }
}

impl From<ProtocolError> for AppError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Unauthenticated(_) => AppError::unauthorized(e.to_string()),
            ProtocolError::InvalidArgument(_) => AppError::bad_request(e.to_string()),
            ProtocolError::IdentityConflict { .. } => AppError::conflict(e.to_string()),
            ProtocolError::Internal(_) => AppError::internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_errors_map_to_status() {
        let cases = [
            (ProtocolError::Unauthenticated("bad token".into()), StatusCode::UNAUTHORIZED),
            (ProtocolError::InvalidArgument("missing agentid".into()), StatusCode::BAD_REQUEST),
            (
                ProtocolError::IdentityConflict {
                    machine: "m-1".into(),
                    bound: "a".into(),
                    presented: "b".into(),
                },
                StatusCode::CONFLICT,
            ),
            (ProtocolError::Internal("boom".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, status) in cases {
            assert_eq!(AppError::from(error).status, status);
        }
    }

    #[test]
    fn test_bad_ttl_is_client_error() {
        assert_eq!(AppError::from(CaError::InvalidTtl).status, StatusCode::BAD_REQUEST);
        assert_eq!(
            AppError::from(CoreError::UserNotFound("u-9".into())).status,
            StatusCode::NOT_FOUND
        );
    }
}
