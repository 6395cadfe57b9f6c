//! HTTP-facing errors.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use docsync_core::sync::protocol::ErrorBody;
use docsync_core::DecodeError;
use thiserror::Error;

use super::storage::StorageError;

/// Errors returned by the HTTP endpoints as `{error, message}` JSON.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("document not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Unauthorized(&'static str),

    #[error("session store unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("malformed snapshot: {0}")]
    Decode(#[from] DecodeError),

    #[error("storage error: {0}")]
    Storage(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) | ApiError::Decode(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::NotFound(_) => "not_found",
            ApiError::Unauthorized(_) => "unauthorized",
            ApiError::ServiceUnavailable(_) => "service_unavailable",
            ApiError::Decode(_) => "decode_error",
            ApiError::Storage(_) => "storage_error",
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        ApiError::Storage(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status().is_server_error() {
            tracing::error!("{}", self);
        }
        let body = ErrorBody {
            error: self.code().to_string(),
            message: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::InvalidRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Decode(DecodeError::Empty).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError::NotFound("d".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::Unauthorized("no").status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::Storage("disk".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
