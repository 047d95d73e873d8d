//! API error types.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use quire_engine::{TaskError, UploadError};
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

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("storage error: {0}")]
    Storage(#[from] quire_storage::StorageError),

    #[error("metadata error: {0}")]
    Metadata(#[from] quire_metadata::MetadataError),

    #[error(transparent)]
    Core(#[from] quire_core::Error),
}

impl ApiError {
    /// Get the error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::Internal(_) => "internal_error",
            Self::Upload(e) => match e {
                UploadError::InvalidArgument(_) => "invalid_argument",
                UploadError::SessionNotFound(_) => "session_not_found",
                UploadError::SessionTerminal { .. } => "session_terminal",
                UploadError::Expired(_) => "upload_expired",
                UploadError::OutOfRange { .. } => "out_of_range",
                UploadError::DuplicateChunk(_) => "duplicate_chunk",
                UploadError::SizeMismatch { .. } => "size_mismatch",
                UploadError::IncompleteUpload { .. } => "incomplete_upload",
                UploadError::AssemblyInProgress(_) => "assembly_in_progress",
                UploadError::AssemblyFailed(_) => "assembly_failed",
                UploadError::ChunkTimeout(_) => "chunk_timeout",
                UploadError::Storage(_) => "storage_error",
                UploadError::Metadata(_) => "metadata_error",
            },
            Self::Task(e) => match e {
                TaskError::NotFound(_) => "task_not_found",
                TaskError::InvalidInput(_) => "invalid_input",
                TaskError::TooLateToCancel(_) => "too_late_to_cancel",
                TaskError::AlreadyTerminal { .. } => "already_terminal",
                TaskError::TaskFailed(_) => "task_failed",
                TaskError::NotCompleted { .. } => "not_completed",
                TaskError::InvalidOutput(_) => "invalid_output",
                TaskError::Metadata(_) => "metadata_error",
                TaskError::Storage(_) => "storage_error",
                TaskError::Progress(_) => "internal_error",
            },
            Self::Storage(_) => "storage_error",
            Self::Metadata(_) => "metadata_error",
            Self::Core(_) => "bad_request",
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Upload(e) => match e {
                UploadError::InvalidArgument(_)
                | UploadError::OutOfRange { .. }
                | UploadError::SizeMismatch { .. }
                | UploadError::IncompleteUpload { .. } => StatusCode::BAD_REQUEST,
                UploadError::SessionNotFound(_) => StatusCode::NOT_FOUND,
                UploadError::SessionTerminal { .. }
                | UploadError::DuplicateChunk(_)
                | UploadError::AssemblyInProgress(_) => StatusCode::CONFLICT,
                UploadError::Expired(_) => StatusCode::GONE,
                UploadError::ChunkTimeout(_) => StatusCode::REQUEST_TIMEOUT,
                UploadError::AssemblyFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
                UploadError::Storage(_) | UploadError::Metadata(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            Self::Task(e) => match e {
                TaskError::NotFound(_) => StatusCode::NOT_FOUND,
                TaskError::InvalidInput(_) => StatusCode::UNPROCESSABLE_ENTITY,
                TaskError::TooLateToCancel(_)
                | TaskError::AlreadyTerminal { .. }
                | TaskError::TaskFailed(_)
                | TaskError::NotCompleted { .. } => StatusCode::CONFLICT,
                TaskError::InvalidOutput(_)
                | TaskError::Metadata(_)
                | TaskError::Storage(_)
                | TaskError::Progress(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Storage(e) => match e {
                quire_storage::StorageError::NotFound(_) => StatusCode::NOT_FOUND,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Metadata(e) => match e {
                quire_metadata::MetadataError::NotFound(_) => StatusCode::NOT_FOUND,
                quire_metadata::MetadataError::AlreadyExists(_) => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Core(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "request failed");
        }
        let body = ErrorResponse {
            code: self.code().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;
