//! Error types for upload and task operations.

use quire_core::{TaskId, TaskStage, UploadId, UploadState};
use quire_metadata::MetadataError;
use quire_storage::StorageError;
use std::time::Duration;
use thiserror::Error;

use crate::progress::ProgressError;

/// Upload session errors.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("upload session not found: {0}")]
    SessionNotFound(UploadId),

    #[error("upload session {upload_id} is {state}")]
    SessionTerminal {
        upload_id: UploadId,
        state: UploadState,
    },

    #[error("upload session {0} has expired")]
    Expired(UploadId),

    #[error("chunk index {index} out of range [0, {total})")]
    OutOfRange { index: i64, total: u32 },

    #[error("chunk {0} was already received")]
    DuplicateChunk(u32),

    #[error("size mismatch: declared {declared} bytes, got {actual}")]
    SizeMismatch { declared: u64, actual: u64 },

    #[error("upload incomplete: missing {} of {total} chunks", missing.len())]
    IncompleteUpload { missing: Vec<u32>, total: u32 },

    #[error("upload {0} is already being assembled")]
    AssemblyInProgress(UploadId),

    #[error("assembly failed: {0}")]
    AssemblyFailed(String),

    #[error("chunk write timed out after {0:?}")]
    ChunkTimeout(Duration),

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

/// Task orchestration errors.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("task {0} is finalizing and can no longer be cancelled")]
    TooLateToCancel(TaskId),

    #[error("task {task_id} is already {stage}")]
    AlreadyTerminal { task_id: TaskId, stage: TaskStage },

    #[error("task failed: {0}")]
    TaskFailed(String),

    #[error("task {task_id} is {stage}, output is not available")]
    NotCompleted { task_id: TaskId, stage: TaskStage },

    #[error("invalid task output: {0}")]
    InvalidOutput(String),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Progress(#[from] ProgressError),
}

/// Result type for upload operations.
pub type UploadResult<T> = std::result::Result<T, UploadError>;

/// Result type for task operations.
pub type TaskResult<T> = std::result::Result<T, TaskError>;
