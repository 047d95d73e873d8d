//! Upload session types and lifecycle.

use crate::hash::ContentHash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

/// Unique identifier for an upload session.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UploadId(Uuid);

impl UploadId {
    /// Generate a new random upload ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from a string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::Error::InvalidId(format!("invalid upload ID: {e}")))
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for UploadId {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Debug for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UploadId({})", self.0)
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Upload session state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadState {
    /// Session created, no chunk received yet.
    Initialized,
    /// At least one chunk received.
    Receiving,
    /// All chunks received, assembly in progress.
    Assembling,
    /// Artifact assembled and validated.
    Completed,
    /// Assembly or validation failed.
    Failed,
    /// Session idled out or was aborted.
    Expired,
}

impl UploadState {
    /// Check if the session can still receive chunks.
    pub fn accepts_chunks(&self) -> bool {
        matches!(self, Self::Initialized | Self::Receiving)
    }

    /// Check if the session reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Expired)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Receiving => "receiving",
            Self::Assembling => "assembling",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to an assembled artifact.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Upload that produced the artifact.
    pub upload_id: UploadId,
    /// Object store key of the assembled bytes.
    pub key: String,
    /// Original filename.
    pub filename: String,
    /// Declared MIME type (validated at assembly).
    pub mime_type: String,
    /// Size in bytes.
    pub size: u64,
    /// SHA-256 of the assembled bytes.
    pub sha256: ContentHash,
}

/// An upload session tracking resumable upload state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadSession {
    /// Unique session identifier.
    pub id: UploadId,
    /// Client-supplied filename.
    pub filename: String,
    /// Declared total size in bytes.
    pub declared_size: u64,
    /// Declared MIME type.
    pub declared_mime_type: String,
    /// Number of chunks the client will send.
    pub total_chunks: u32,
    /// Indices received so far.
    pub received_chunks: BTreeSet<u32>,
    /// Current session state.
    pub state: UploadState,
    /// Set once the session is Completed.
    pub artifact: Option<ArtifactRef>,
    /// Human-readable reason for Failed/Expired sessions.
    pub failure_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_activity_at: OffsetDateTime,
}

impl UploadSession {
    /// Create a new session in the Initialized state.
    pub fn new(
        filename: impl Into<String>,
        declared_size: u64,
        declared_mime_type: impl Into<String>,
        total_chunks: u32,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: UploadId::new(),
            filename: filename.into(),
            declared_size,
            declared_mime_type: declared_mime_type.into(),
            total_chunks,
            received_chunks: BTreeSet::new(),
            state: UploadState::Initialized,
            artifact: None,
            failure_reason: None,
            created_at: now,
            last_activity_at: now,
        }
    }

    pub fn received_count(&self) -> u32 {
        self.received_chunks.len() as u32
    }

    /// True once every index in `[0, total_chunks)` has been received.
    pub fn is_fully_received(&self) -> bool {
        self.received_count() == self.total_chunks
    }

    /// Indices not yet received, in ascending order.
    pub fn missing_chunks(&self) -> Vec<u32> {
        (0..self.total_chunks)
            .filter(|i| !self.received_chunks.contains(i))
            .collect()
    }

    /// Check whether the session has been idle longer than `idle_timeout` at `now`.
    pub fn is_idle(&self, now: OffsetDateTime, idle_timeout: time::Duration) -> bool {
        now - self.last_activity_at > idle_timeout
    }
}

/// Inclusive byte range of a chunk within the assembled artifact.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    /// Inclusive end offset.
    pub end: u64,
}

impl ByteRange {
    /// Range covering `len` bytes starting at `start`. `len` must be non-zero.
    pub fn with_len(start: u64, len: u64) -> Self {
        Self {
            start,
            end: start + len.saturating_sub(1),
        }
    }

    /// Number of bytes covered.
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// A chunk persisted for an upload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub upload_id: UploadId,
    /// Position in the upload (0-indexed).
    pub index: u32,
    /// Offsets within the assembled artifact. Known only once every
    /// lower-indexed chunk has been received.
    pub byte_range: Option<ByteRange>,
    pub size_bytes: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
}

/// Request to create an upload session.
///
/// Sizes are signed so that negative values are reported as invalid
/// arguments instead of deserialization failures.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InitUploadRequest {
    pub filename: String,
    /// Total file size in bytes.
    pub file_size: i64,
    /// Declared MIME type.
    pub file_type: String,
    pub total_chunks: i64,
}

/// Response from creating an upload session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InitUploadResponse {
    pub upload_id: UploadId,
    /// Advisory limit for concurrent chunk requests.
    pub max_parallel_chunks: u32,
}

/// Acknowledgement of a stored chunk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkReceipt {
    pub upload_id: UploadId,
    pub chunk_index: u32,
    pub received_count: u32,
    pub total_chunks: u32,
}

/// Response from completing an upload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompleteUploadResponse {
    pub upload_id: UploadId,
    pub artifact_ref: ArtifactRef,
    pub status: UploadState,
}

/// Response from querying upload state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadStatusResponse {
    pub upload_id: UploadId,
    pub filename: String,
    pub received_count: u32,
    pub total_chunks: u32,
    pub state: UploadState,
    /// Indices still missing, for resuming after a reconnect.
    pub missing_chunks: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_ref: Option<ArtifactRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl From<&UploadSession> for UploadStatusResponse {
    fn from(session: &UploadSession) -> Self {
        Self {
            upload_id: session.id,
            filename: session.filename.clone(),
            received_count: session.received_count(),
            total_chunks: session.total_chunks,
            state: session.state,
            missing_chunks: session.missing_chunks(),
            artifact_ref: session.artifact.clone(),
            reason: session.failure_reason.clone(),
        }
    }
}
