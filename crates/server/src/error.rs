//! API error types.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use cask_storage::{Capability, StorageError};
use serde::Serialize;

/// API error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
}

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    /// A request the caller can fix. The message is returned verbatim.
    #[error("{0}")]
    InvalidRequest(String),

    #[error("capability not supported by the storage backend: {capability}")]
    Unsupported { capability: Capability },

    #[error("internal error: {0}")]
    Internal(String),

    #[error("storage error: {0}")]
    Storage(StorageError),

    #[error("metadata error: {0}")]
    Metadata(#[from] cask_metadata::MetadataError),

    #[error("core error: {0}")]
    Core(#[from] cask_core::Error),
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Unsupported { capability } => Self::Unsupported { capability },
            other => Self::Storage(other),
        }
    }
}

impl ApiError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Get the error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Unsupported { .. } => "unsupported",
            Self::Internal(_) => "internal_error",
            Self::Storage(_) => "storage_error",
            Self::Metadata(_) => "metadata_error",
            Self::Core(_) => "core_error",
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unsupported { .. } => StatusCode::NOT_IMPLEMENTED,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Storage(e) => match e {
                StorageError::NotFound(_) => StatusCode::NOT_FOUND,
                StorageError::InvalidKey(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Metadata(e) => match e {
                cask_metadata::MetadataError::NotFound(_) => StatusCode::NOT_FOUND,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Core(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            code: self.code().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_storage_error_maps_to_501() {
        let err = ApiError::from(StorageError::Unsupported {
            capability: Capability::Multipart,
        });
        assert_eq!(err.code(), "unsupported");
        assert_eq!(err.status_code(), StatusCode::NOT_IMPLEMENTED);
    }

    #[test]
    fn test_invalid_request_message_is_verbatim() {
        let err = ApiError::invalid("Upload URL expired");
        assert_eq!(err.to_string(), "Upload URL expired");
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), "invalid_request");
    }

    #[test]
    fn test_storage_not_found_maps_to_404() {
        let err = ApiError::from(StorageError::NotFound("ws/k".to_string()));
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }
}
