//! Upload session repository.

use crate::error::{MetadataResult, Transition};
use async_trait::async_trait;
use quire_core::{ArtifactRef, UploadId, UploadSession, UploadState};
use time::OffsetDateTime;

/// Fields written alongside an upload state transition.
#[derive(Clone, Debug, Default)]
pub struct SessionUpdate {
    pub failure_reason: Option<String>,
    pub artifact: Option<ArtifactRef>,
    /// Reject the transition unless the session's last activity is before
    /// this instant.
    pub idle_before: Option<OffsetDateTime>,
}

impl SessionUpdate {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            failure_reason: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn completed(artifact: ArtifactRef) -> Self {
        Self {
            artifact: Some(artifact),
            ..Self::default()
        }
    }

    pub fn if_idle_before(mut self, cutoff: OffsetDateTime) -> Self {
        self.idle_before = Some(cutoff);
        self
    }
}

/// Result of marking a chunk index as received.
#[derive(Clone, Debug)]
pub enum ChunkMark {
    /// Index added; the session is now Receiving.
    Recorded(UploadSession),
    /// Index was already in the received set.
    Duplicate(UploadSession),
    /// The session no longer accepts chunks.
    Closed(UploadSession),
}

/// Repository for upload session operations.
#[async_trait]
pub trait UploadRepo: Send + Sync {
    /// Create a new upload session.
    async fn create_session(&self, session: &UploadSession) -> MetadataResult<()>;

    /// Get an upload session by ID.
    async fn get_session(&self, upload_id: UploadId) -> MetadataResult<Option<UploadSession>>;

    /// Atomically add `index` to the received set.
    ///
    /// Only sessions in Initialized/Receiving accept the mark; the first mark
    /// moves the session to Receiving. Returns `NotFound` if the session does
    /// not exist.
    async fn mark_chunk_received(
        &self,
        upload_id: UploadId,
        index: u32,
        at: OffsetDateTime,
    ) -> MetadataResult<ChunkMark>;

    /// Refresh `last_activity_at` without changing state.
    async fn touch_session(&self, upload_id: UploadId, at: OffsetDateTime) -> MetadataResult<()>;

    /// Move the session to `to` if its current state is one of `from` and,
    /// when `update.idle_before` is set, it has been idle since then.
    ///
    /// Returns `NotFound` if the session does not exist.
    async fn transition_session(
        &self,
        upload_id: UploadId,
        from: &[UploadState],
        to: UploadState,
        update: SessionUpdate,
        at: OffsetDateTime,
    ) -> MetadataResult<Transition<UploadSession>>;

    /// Non-terminal sessions whose last activity is before `idle_since`.
    async fn list_idle_sessions(
        &self,
        idle_since: OffsetDateTime,
        limit: usize,
    ) -> MetadataResult<Vec<UploadSession>>;

    /// Terminal sessions whose last state change is before `finished_before`.
    async fn list_finished_sessions(
        &self,
        finished_before: OffsetDateTime,
        limit: usize,
    ) -> MetadataResult<Vec<UploadSession>>;

    /// Delete a session record.
    async fn delete_session(&self, upload_id: UploadId) -> MetadataResult<()>;

    /// Count sessions that have not reached a terminal state.
    async fn count_active_sessions(&self) -> MetadataResult<u64>;
}
