//! Upload session state machine.
//!
//! ```text
//! Initialized --first chunk--> Receiving --complete--> Assembling --> Completed
//!      |                           |                        |
//!      +------- idle / abort ------+--> Expired             +--> Failed
//! ```
//!
//! Session state lives in the metadata store and every state change is a
//! compare-and-set, so concurrent requests for the same upload cannot both
//! win a transition. Chunk bytes are delegated to the [`ChunkStore`].

use crate::error::{UploadError, UploadResult};
use bytes::Bytes;
use quire_core::config::UploadConfig;
use quire_core::mime::{self, ContentValidator};
use quire_core::upload::ChunkReceipt;
use quire_core::{ArtifactRef, UploadId, UploadSession, UploadState};
use quire_metadata::{ChunkMark, MetadataStore, SessionUpdate, Transition};
use quire_storage::{AssemblyCheck, ChunkStore, ChunkStoreError};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};

/// Sessions examined per idle sweep.
const EXPIRY_BATCH: usize = 1000;

/// Terminal sessions removed per reap pass.
const REAP_BATCH: usize = 1000;

/// Outcome of [`UploadSessionManager::complete`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    pub artifact: ArtifactRef,
    /// False when an earlier call already completed the session.
    pub assembled: bool,
}

impl Completion {
    fn existing(session: &UploadSession) -> UploadResult<Self> {
        let artifact = session
            .artifact
            .clone()
            .ok_or_else(|| UploadError::Storage("completed session has no artifact".to_string()))?;
        Ok(Self {
            artifact,
            assembled: false,
        })
    }
}

/// Drives upload sessions through their lifecycle.
pub struct UploadSessionManager {
    metadata: Arc<dyn MetadataStore>,
    chunks: Arc<dyn ChunkStore>,
    config: UploadConfig,
}

impl UploadSessionManager {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        chunks: Arc<dyn ChunkStore>,
        config: UploadConfig,
    ) -> Self {
        Self {
            metadata,
            chunks,
            config,
        }
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// Open a session in the Initialized state.
    #[instrument(skip(self), fields(upload_id))]
    pub async fn init(
        &self,
        filename: &str,
        total_chunks: i64,
        declared_size: i64,
        mime_type: &str,
    ) -> UploadResult<UploadSession> {
        let (total_chunks, declared_size) =
            self.validate_init(filename, total_chunks, declared_size, mime_type)?;

        let session = UploadSession::new(
            filename.trim(),
            declared_size,
            mime::essence(mime_type),
            total_chunks,
        );
        tracing::Span::current().record("upload_id", tracing::field::display(session.id));

        self.metadata.create_session(&session).await?;
        if let Err(e) = self
            .chunks
            .allocate(session.id, total_chunks, declared_size)
            .await
        {
            if let Err(cleanup) = self.metadata.delete_session(session.id).await {
                warn!(error = %cleanup, "failed to remove session after allocation failure");
            }
            return Err(UploadError::Storage(e.to_string()));
        }

        info!(
            filename,
            total_chunks, declared_size, mime_type, "upload session created"
        );
        Ok(session)
    }

    fn validate_init(
        &self,
        filename: &str,
        total_chunks: i64,
        declared_size: i64,
        mime_type: &str,
    ) -> UploadResult<(u32, u64)> {
        let invalid = |msg: String| Err(UploadError::InvalidArgument(msg));

        if total_chunks <= 0 {
            return invalid(format!("total_chunks must be positive, got {total_chunks}"));
        }
        if declared_size <= 0 {
            return invalid(format!("file_size must be positive, got {declared_size}"));
        }
        let filename = filename.trim();
        if filename.is_empty() {
            return invalid("filename cannot be empty".to_string());
        }
        if filename.contains(['/', '\\', '\0']) || filename == "." || filename == ".." {
            return invalid(format!("filename '{filename}' must not contain a path"));
        }

        let total_chunks = u32::try_from(total_chunks)
            .ok()
            .filter(|&n| n <= self.config.max_total_chunks);
        let Some(total_chunks) = total_chunks else {
            return invalid(format!(
                "total_chunks exceeds the limit of {}",
                self.config.max_total_chunks
            ));
        };
        let declared_size = declared_size as u64;
        if declared_size > self.config.max_declared_size {
            return invalid(format!(
                "file_size {declared_size} exceeds the limit of {}",
                self.config.max_declared_size
            ));
        }
        // Every chunk carries at least one byte.
        if u64::from(total_chunks) > declared_size {
            return invalid(format!(
                "{total_chunks} chunks cannot carry only {declared_size} bytes"
            ));
        }

        if !self.config.is_mime_allowed(mime_type) {
            return invalid(format!("file type '{mime_type}' is not accepted"));
        }
        mime::check_filename(filename, mime_type)
            .map_err(|e| UploadError::InvalidArgument(e.to_string()))?;

        Ok((total_chunks, declared_size))
    }

    async fn load(&self, upload_id: UploadId) -> UploadResult<UploadSession> {
        self.metadata
            .get_session(upload_id)
            .await?
            .ok_or(UploadError::SessionNotFound(upload_id))
    }

    fn closed(session: &UploadSession) -> UploadError {
        match session.state {
            UploadState::Expired => UploadError::Expired(session.id),
            state => UploadError::SessionTerminal {
                upload_id: session.id,
                state,
            },
        }
    }

    /// Store one chunk and record its index.
    ///
    /// Distinct indices may arrive concurrently and in any order. A repeated
    /// index is rejected and never overwrites the stored bytes.
    #[instrument(skip(self, data), fields(upload_id = %upload_id, size = data.len()))]
    pub async fn receive_chunk(
        &self,
        upload_id: UploadId,
        index: i64,
        data: Bytes,
    ) -> UploadResult<ChunkReceipt> {
        let session = self.load(upload_id).await?;
        if !session.state.accepts_chunks() {
            return Err(Self::closed(&session));
        }
        let index = match u32::try_from(index) {
            Ok(i) if i < session.total_chunks => i,
            _ => {
                return Err(UploadError::OutOfRange {
                    index,
                    total: session.total_chunks,
                });
            }
        };
        if session.received_chunks.contains(&index) {
            warn!(index, "duplicate chunk rejected");
            return Err(UploadError::DuplicateChunk(index));
        }

        let now = OffsetDateTime::now_utc();
        self.metadata.touch_session(upload_id, now).await?;

        if let Err(e) = self.chunks.write_chunk(upload_id, index, data).await {
            return Err(self.chunk_error(upload_id, e).await);
        }

        match self
            .metadata
            .mark_chunk_received(upload_id, index, OffsetDateTime::now_utc())
            .await?
        {
            ChunkMark::Recorded(session) => Ok(ChunkReceipt {
                upload_id,
                chunk_index: index,
                received_count: session.received_count(),
                total_chunks: session.total_chunks,
            }),
            ChunkMark::Duplicate(_) => Err(UploadError::DuplicateChunk(index)),
            ChunkMark::Closed(session) => Err(Self::closed(&session)),
        }
    }

    /// Translate a chunk store failure into the client-facing error.
    async fn chunk_error(&self, upload_id: UploadId, err: ChunkStoreError) -> UploadError {
        match err {
            ChunkStoreError::OutOfRange { index, total } => UploadError::OutOfRange {
                index: i64::from(index),
                total,
            },
            ChunkStoreError::DuplicateChunk(index) => {
                warn!(index, "duplicate chunk rejected");
                UploadError::DuplicateChunk(index)
            }
            ChunkStoreError::EmptyChunk(index) => {
                UploadError::InvalidArgument(format!("chunk {index} is empty"))
            }
            ChunkStoreError::SizeMismatch { declared, actual } => {
                warn!(declared, actual, "chunk would exceed declared size");
                UploadError::SizeMismatch { declared, actual }
            }
            ChunkStoreError::Timeout(after) => UploadError::ChunkTimeout(after),
            // The session closed underneath the write.
            ChunkStoreError::NotAllocated(_) | ChunkStoreError::Sealed => {
                match self.metadata.get_session(upload_id).await {
                    Ok(Some(session)) if !session.state.accepts_chunks() => Self::closed(&session),
                    Ok(None) => UploadError::SessionNotFound(upload_id),
                    _ => UploadError::Storage(err.to_string()),
                }
            }
            other => UploadError::Storage(other.to_string()),
        }
    }

    /// Assemble a fully received upload into its artifact.
    ///
    /// Calling again on a Completed session returns the same artifact.
    #[instrument(skip(self), fields(upload_id = %upload_id))]
    pub async fn complete(&self, upload_id: UploadId) -> UploadResult<Completion> {
        let session = self.load(upload_id).await?;
        match session.state {
            UploadState::Completed => return Completion::existing(&session),
            UploadState::Assembling => return Err(UploadError::AssemblyInProgress(upload_id)),
            UploadState::Failed | UploadState::Expired => return Err(Self::closed(&session)),
            UploadState::Initialized | UploadState::Receiving => {}
        }
        if !session.is_fully_received() {
            return Err(UploadError::IncompleteUpload {
                missing: session.missing_chunks(),
                total: session.total_chunks,
            });
        }

        let session = match self
            .metadata
            .transition_session(
                upload_id,
                &[UploadState::Receiving],
                UploadState::Assembling,
                SessionUpdate::default(),
                OffsetDateTime::now_utc(),
            )
            .await?
        {
            Transition::Applied(session) => session,
            // Lost the race to another complete or to expiry.
            Transition::Rejected(current) => {
                return match current.state {
                    UploadState::Completed => Completion::existing(&current),
                    UploadState::Assembling => Err(UploadError::AssemblyInProgress(upload_id)),
                    _ => Err(Self::closed(&current)),
                };
            }
        };
        info!("assembling upload");

        let assembled = match ContentValidator::new(&session.filename, &session.declared_mime_type)
        {
            Ok(mut validator) => self
                .chunks
                .assemble(upload_id, &mut validator as &mut dyn AssemblyCheck)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match assembled {
            Ok(artifact) => {
                let artifact = ArtifactRef {
                    upload_id,
                    key: artifact.key,
                    filename: session.filename.clone(),
                    mime_type: session.declared_mime_type.clone(),
                    size: artifact.size,
                    sha256: artifact.sha256,
                };
                self.metadata
                    .transition_session(
                        upload_id,
                        &[UploadState::Assembling],
                        UploadState::Completed,
                        SessionUpdate::completed(artifact.clone()),
                        OffsetDateTime::now_utc(),
                    )
                    .await?;
                info!(size = artifact.size, sha256 = %artifact.sha256, "upload completed");
                Ok(Completion {
                    artifact,
                    assembled: true,
                })
            }
            Err(reason) => {
                warn!(%reason, "assembly failed");
                self.metadata
                    .transition_session(
                        upload_id,
                        &[UploadState::Assembling],
                        UploadState::Failed,
                        SessionUpdate::failed(reason.clone()),
                        OffsetDateTime::now_utc(),
                    )
                    .await?;
                if let Err(e) = self.chunks.discard(upload_id).await {
                    warn!(error = %e, "failed to discard staged chunks");
                }
                Err(UploadError::AssemblyFailed(reason))
            }
        }
    }

    /// Read-only snapshot of a session.
    pub async fn status(&self, upload_id: UploadId) -> UploadResult<UploadSession> {
        self.load(upload_id).await
    }

    /// Abandon an open session and release its bytes.
    ///
    /// Aborting an already expired session succeeds.
    #[instrument(skip(self), fields(upload_id = %upload_id))]
    pub async fn abort(&self, upload_id: UploadId) -> UploadResult<UploadSession> {
        match self
            .metadata
            .transition_session(
                upload_id,
                &[UploadState::Initialized, UploadState::Receiving],
                UploadState::Expired,
                SessionUpdate::failed("aborted by client"),
                OffsetDateTime::now_utc(),
            )
            .await
        {
            Ok(Transition::Applied(session)) => {
                self.discard(upload_id).await;
                info!("upload aborted");
                Ok(session)
            }
            Ok(Transition::Rejected(session)) if session.state == UploadState::Expired => {
                Ok(session)
            }
            Ok(Transition::Rejected(session)) => Err(Self::closed(&session)),
            Err(quire_metadata::MetadataError::NotFound(_)) => {
                Err(UploadError::SessionNotFound(upload_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Expire sessions idle past the configured timeout.
    ///
    /// A session touched after it was listed keeps its state. Returns the
    /// number of sessions expired by this call.
    #[instrument(skip(self))]
    pub async fn expire_idle(&self, now: OffsetDateTime) -> UploadResult<usize> {
        let idle_since = now - self.config.idle_timeout();
        let candidates = self
            .metadata
            .list_idle_sessions(idle_since, EXPIRY_BATCH)
            .await?;

        let mut expired = 0;
        for session in candidates {
            let reason = format!(
                "no activity for more than {} seconds",
                self.config.idle_timeout_secs
            );
            match self
                .metadata
                .transition_session(
                    session.id,
                    &[UploadState::Initialized, UploadState::Receiving],
                    UploadState::Expired,
                    SessionUpdate::failed(reason).if_idle_before(idle_since),
                    now,
                )
                .await
            {
                Ok(Transition::Applied(_)) => {
                    self.discard(session.id).await;
                    info!(upload_id = %session.id, "idle upload expired");
                    expired += 1;
                }
                Ok(Transition::Rejected(_)) => {}
                Err(e) => warn!(upload_id = %session.id, error = %e, "failed to expire session"),
            }
        }
        Ok(expired)
    }

    /// Remove terminal sessions whose last state change is older than the
    /// retention window. A completed session's artifact is deleted with it.
    #[instrument(skip(self))]
    pub async fn reap(&self, now: OffsetDateTime) -> UploadResult<usize> {
        let finished = self
            .metadata
            .list_finished_sessions(now - self.config.retention(), REAP_BATCH)
            .await?;

        let mut reaped = 0;
        for session in finished {
            if session.state == UploadState::Completed
                && let Err(e) = self.chunks.remove_artifact(session.id).await
            {
                warn!(upload_id = %session.id, error = %e, "failed to delete artifact");
                continue;
            }
            self.discard(session.id).await;
            self.metadata.delete_session(session.id).await?;
            debug!(upload_id = %session.id, state = ?session.state, "upload session reaped");
            reaped += 1;
        }
        Ok(reaped)
    }

    async fn discard(&self, upload_id: UploadId) {
        if let Err(e) = self.chunks.discard(upload_id).await {
            warn!(%upload_id, error = %e, "failed to discard staged chunks");
        }
    }
}
