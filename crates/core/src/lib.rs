//! Core domain types and shared logic for the quire document pipeline.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Upload sessions, chunk records and artifact references
//! - Generation tasks, progress events and input references
//! - MIME validation for assembled artifacts
//! - Configuration

pub mod config;
pub mod error;
pub mod hash;
pub mod mime;
pub mod task;
pub mod upload;

pub use error::{Error, Result};
pub use hash::{ContentHash, ContentHasher};
pub use task::{
    InputRef, OutputSection, ProgressEvent, ProgressSnapshot, ProgressUpdate, Task, TaskId,
    TaskKind, TaskOptions, TaskOutput, TaskStage,
};
pub use upload::{ArtifactRef, ByteRange, ChunkRecord, UploadId, UploadSession, UploadState};

/// Maximum chunk request body: 32 MiB
pub const MAX_CHUNK_BODY_SIZE: u64 = 32 * 1024 * 1024;

/// API version reported by the gateway.
pub const API_VERSION: &str = "v1";
