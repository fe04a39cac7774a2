//! HTTP mapping for [`StorageError`]
//!
//! Errors become `{success: false, error}` JSON bodies. I/O details are logged
//! and replaced with a generic message. This only applies before a response
//! has started: raw downloads and archives that fail mid-stream are aborted
//! instead (see `storage::archive`).

use axum::extract::multipart::MultipartRejection;
use axum::extract::rejection::{PathRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::protocol::{ErrorResponse, StorageError};

impl StorageError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidIdentifier { .. }
            | Self::InvalidPath { .. }
            | Self::IsDirectory { .. }
            | Self::MissingParameter { .. }
            | Self::InvalidRequest { .. }
            | Self::UploadParse { .. }
            | Self::AllUploadsFailed => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for StorageError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let message = match &self {
            Self::Io { message } => {
                tracing::error!(error = %message, "storage I/O failure");
                "An internal storage error occurred".to_string()
            }
            other => {
                tracing::debug!(error = %other, status = status.as_u16(), "request rejected");
                other.to_string()
            }
        };

        let body = ErrorResponse {
            success: false,
            error: message,
        };

        (status, Json(body)).into_response()
    }
}

impl From<PathRejection> for StorageError {
    fn from(rejection: PathRejection) -> Self {
        StorageError::InvalidRequest {
            message: rejection.body_text(),
        }
    }
}

impl From<QueryRejection> for StorageError {
    fn from(rejection: QueryRejection) -> Self {
        StorageError::InvalidRequest {
            message: rejection.body_text(),
        }
    }
}

impl From<MultipartRejection> for StorageError {
    fn from(rejection: MultipartRejection) -> Self {
        StorageError::UploadParse {
            message: rejection.body_text(),
        }
    }
}
