//! Chunk staging and assembly.
//!
//! Chunks are persisted under `uploads/{id}/chunks/{index}` and concatenated
//! in index order into `artifacts/{id}` once every index is present. The
//! per-upload bookkeeping (which indices are claimed, how many bytes are
//! reserved) is mutated under a short map-entry lock; the byte writes
//! themselves run without it.

use crate::error::StorageError;
use crate::traits::ObjectStore;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use quire_core::mime::ContentValidator;
use quire_core::{ByteRange, ChunkRecord, ContentHash, UploadId};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, instrument, warn};

/// Chunk store errors.
#[derive(Debug, Error)]
pub enum ChunkStoreError {
    #[error("no staging allocation for upload {0}")]
    NotAllocated(UploadId),

    #[error("upload {0} is already allocated")]
    AlreadyAllocated(UploadId),

    #[error("chunk index {index} out of range [0, {total})")]
    OutOfRange { index: u32, total: u32 },

    #[error("chunk {0} was already received")]
    DuplicateChunk(u32),

    #[error("chunk {0} is empty")]
    EmptyChunk(u32),

    #[error("size mismatch: declared {declared} bytes, got {actual}")]
    SizeMismatch { declared: u64, actual: u64 },

    #[error("upload incomplete: {missing} of {total} chunks missing")]
    IncompleteUpload { missing: u32, total: u32 },

    #[error("assembly already in progress")]
    AssemblyInProgress,

    #[error("upload is being assembled")]
    Sealed,

    #[error("chunk write timed out after {0:?}")]
    Timeout(Duration),

    #[error("content rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type ChunkStoreResult<T> = std::result::Result<T, ChunkStoreError>;

/// Handle returned by [`ChunkStore::allocate`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkAllocation {
    pub upload_id: UploadId,
    pub total_chunks: u32,
    pub declared_size: u64,
    /// Key prefix holding the staged chunks.
    pub staging_prefix: String,
}

/// Handle to an assembled artifact.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssembledArtifact {
    pub key: String,
    pub size: u64,
    pub sha256: ContentHash,
}

/// Content inspection applied while chunks are concatenated.
pub trait AssemblyCheck: Send {
    fn update(&mut self, data: &[u8]) -> Result<(), String>;
    fn finish(&mut self) -> Result<(), String>;
}

impl AssemblyCheck for ContentValidator {
    fn update(&mut self, data: &[u8]) -> Result<(), String> {
        ContentValidator::update(self, data).map_err(|e| e.to_string())
    }

    fn finish(&mut self) -> Result<(), String> {
        ContentValidator::finish(self).map_err(|e| e.to_string())
    }
}

/// Accepts any content.
pub struct AcceptAll;

impl AssemblyCheck for AcceptAll {
    fn update(&mut self, _data: &[u8]) -> Result<(), String> {
        Ok(())
    }

    fn finish(&mut self) -> Result<(), String> {
        Ok(())
    }
}

/// Durable staging area for chunk bytes plus per-upload metadata.
#[async_trait]
pub trait ChunkStore: Send + Sync + 'static {
    /// Reserve staging for an upload.
    async fn allocate(
        &self,
        upload_id: UploadId,
        total_chunks: u32,
        declared_size: u64,
    ) -> ChunkStoreResult<ChunkAllocation>;

    /// Persist one chunk. The bytes are durable once this returns `Ok`.
    async fn write_chunk(
        &self,
        upload_id: UploadId,
        index: u32,
        data: Bytes,
    ) -> ChunkStoreResult<ChunkRecord>;

    /// Concatenate all chunks in index order into a single artifact.
    ///
    /// A successful assembly releases the allocation, so the upload can no
    /// longer be written or assembled again.
    async fn assemble(
        &self,
        upload_id: UploadId,
        check: &mut dyn AssemblyCheck,
    ) -> ChunkStoreResult<AssembledArtifact>;

    /// Release staged bytes and metadata. Idempotent.
    async fn discard(&self, upload_id: UploadId) -> ChunkStoreResult<()>;

    /// Delete the assembled artifact. Idempotent.
    async fn remove_artifact(&self, upload_id: UploadId) -> ChunkStoreResult<()>;

    /// Persisted chunk records in index order.
    async fn records(&self, upload_id: UploadId) -> ChunkStoreResult<Vec<ChunkRecord>>;
}

pub fn staging_prefix(upload_id: UploadId) -> String {
    format!("uploads/{upload_id}/")
}

pub fn chunk_key(upload_id: UploadId, index: u32) -> String {
    format!("uploads/{upload_id}/chunks/{index:08}")
}

pub fn artifact_key(upload_id: UploadId) -> String {
    format!("artifacts/{upload_id}")
}

#[derive(Clone, Copy, Debug)]
enum Slot {
    /// Index claimed, bytes in flight.
    Writing,
    Stored {
        size: u64,
        received_at: OffsetDateTime,
    },
}

#[derive(Clone, Copy, Debug)]
enum Phase {
    Open,
    Assembling,
}

#[derive(Debug)]
struct Allocation {
    total_chunks: u32,
    declared_size: u64,
    reserved_bytes: u64,
    slots: BTreeMap<u32, Slot>,
    phase: Phase,
}

impl Allocation {
    fn stored_count(&self) -> u32 {
        self.slots
            .values()
            .filter(|s| matches!(s, Slot::Stored { .. }))
            .count() as u32
    }

    fn stored_bytes(&self) -> u64 {
        self.slots
            .values()
            .map(|s| match s {
                Slot::Stored { size, .. } => *size,
                Slot::Writing => 0,
            })
            .sum()
    }

    /// Records for every stored chunk. Byte ranges are known only while
    /// every lower index is stored.
    fn records(&self, upload_id: UploadId) -> Vec<ChunkRecord> {
        let mut offset = Some(0u64);
        let mut expected = 0u32;
        let mut records = Vec::new();
        for (&index, slot) in &self.slots {
            if index != expected {
                offset = None;
            }
            expected = index + 1;
            match *slot {
                Slot::Stored { size, received_at } => {
                    records.push(ChunkRecord {
                        upload_id,
                        index,
                        byte_range: offset.map(|start| ByteRange::with_len(start, size)),
                        size_bytes: size,
                        received_at,
                    });
                    offset = offset.map(|start| start + size);
                }
                Slot::Writing => offset = None,
            }
        }
        records
    }
}

/// [`ChunkStore`] staging chunks in an [`ObjectStore`].
pub struct StagedChunkStore {
    store: Arc<dyn ObjectStore>,
    allocations: DashMap<UploadId, Allocation>,
    write_timeout: Duration,
}

impl StagedChunkStore {
    pub fn new(store: Arc<dyn ObjectStore>, write_timeout: Duration) -> Self {
        Self {
            store,
            allocations: DashMap::new(),
            write_timeout,
        }
    }

    /// Give back a claimed index after a failed write.
    fn release(&self, upload_id: UploadId, index: u32, size: u64) {
        if let Some(mut alloc) = self.allocations.get_mut(&upload_id)
            && matches!(alloc.slots.get(&index), Some(Slot::Writing))
        {
            alloc.slots.remove(&index);
            alloc.reserved_bytes = alloc.reserved_bytes.saturating_sub(size);
        }
    }

    fn set_phase(&self, upload_id: UploadId, phase: Phase) {
        if let Some(mut alloc) = self.allocations.get_mut(&upload_id) {
            alloc.phase = phase;
        }
    }

    async fn concatenate(
        &self,
        upload_id: UploadId,
        total_chunks: u32,
        check: &mut dyn AssemblyCheck,
    ) -> ChunkStoreResult<AssembledArtifact> {
        let key = artifact_key(upload_id);
        let mut upload = self.store.put_stream(&key).await?;
        let mut hasher = ContentHash::hasher();
        let mut size = 0u64;

        let written: ChunkStoreResult<()> = async {
            for index in 0..total_chunks {
                let mut stream = self.store.get_stream(&chunk_key(upload_id, index)).await?;
                while let Some(data) = stream.next().await {
                    let data = data?;
                    check.update(&data).map_err(ChunkStoreError::Rejected)?;
                    hasher.update(&data);
                    size += data.len() as u64;
                    upload.write(data).await?;
                }
            }
            check.finish().map_err(ChunkStoreError::Rejected)
        }
        .await;

        if let Err(e) = written {
            if let Err(abort_err) = upload.abort().await {
                warn!(%upload_id, error = %abort_err, "failed to abort artifact upload");
            }
            return Err(e);
        }

        upload.finish().await?;
        Ok(AssembledArtifact {
            key,
            size,
            sha256: hasher.finalize(),
        })
    }
}

#[async_trait]
impl ChunkStore for StagedChunkStore {
    #[instrument(skip(self), fields(upload_id = %upload_id))]
    async fn allocate(
        &self,
        upload_id: UploadId,
        total_chunks: u32,
        declared_size: u64,
    ) -> ChunkStoreResult<ChunkAllocation> {
        use dashmap::mapref::entry::Entry;

        match self.allocations.entry(upload_id) {
            Entry::Occupied(_) => Err(ChunkStoreError::AlreadyAllocated(upload_id)),
            Entry::Vacant(slot) => {
                slot.insert(Allocation {
                    total_chunks,
                    declared_size,
                    reserved_bytes: 0,
                    slots: BTreeMap::new(),
                    phase: Phase::Open,
                });
                Ok(ChunkAllocation {
                    upload_id,
                    total_chunks,
                    declared_size,
                    staging_prefix: staging_prefix(upload_id),
                })
            }
        }
    }

    #[instrument(skip(self, data), fields(upload_id = %upload_id, size = data.len()))]
    async fn write_chunk(
        &self,
        upload_id: UploadId,
        index: u32,
        data: Bytes,
    ) -> ChunkStoreResult<ChunkRecord> {
        let size = data.len() as u64;
        if size == 0 {
            return Err(ChunkStoreError::EmptyChunk(index));
        }

        // Claim the index and reserve its bytes atomically.
        {
            let mut alloc = self
                .allocations
                .get_mut(&upload_id)
                .ok_or(ChunkStoreError::NotAllocated(upload_id))?;
            if !matches!(alloc.phase, Phase::Open) {
                return Err(ChunkStoreError::Sealed);
            }
            if index >= alloc.total_chunks {
                return Err(ChunkStoreError::OutOfRange {
                    index,
                    total: alloc.total_chunks,
                });
            }
            if alloc.slots.contains_key(&index) {
                return Err(ChunkStoreError::DuplicateChunk(index));
            }
            let attempted = alloc.reserved_bytes + size;
            if attempted > alloc.declared_size {
                return Err(ChunkStoreError::SizeMismatch {
                    declared: alloc.declared_size,
                    actual: attempted,
                });
            }
            alloc.reserved_bytes = attempted;
            alloc.slots.insert(index, Slot::Writing);
        }

        let key = chunk_key(upload_id, index);
        let failure = match tokio::time::timeout(self.write_timeout, self.store.put(&key, data)).await
        {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(ChunkStoreError::Storage(e)),
            Err(_) => Some(ChunkStoreError::Timeout(self.write_timeout)),
        };
        if let Some(err) = failure {
            self.release(upload_id, index, size);
            let _ = self.store.delete(&key).await;
            warn!(index, error = %err, "chunk write failed");
            return Err(err);
        }

        let received_at = OffsetDateTime::now_utc();
        let record = self.allocations.get_mut(&upload_id).map(|mut alloc| {
            alloc.slots.insert(index, Slot::Stored { size, received_at });
            alloc
                .records(upload_id)
                .into_iter()
                .find(|r| r.index == index)
        });

        match record {
            Some(Some(record)) => {
                debug!(index, "chunk stored");
                Ok(record)
            }
            _ => {
                // Discarded while the write was in flight.
                let _ = self.store.delete(&key).await;
                Err(ChunkStoreError::NotAllocated(upload_id))
            }
        }
    }

    #[instrument(skip(self, check), fields(upload_id = %upload_id))]
    async fn assemble(
        &self,
        upload_id: UploadId,
        check: &mut dyn AssemblyCheck,
    ) -> ChunkStoreResult<AssembledArtifact> {
        let total_chunks = {
            let mut alloc = self
                .allocations
                .get_mut(&upload_id)
                .ok_or(ChunkStoreError::NotAllocated(upload_id))?;
            if matches!(alloc.phase, Phase::Assembling) {
                return Err(ChunkStoreError::AssemblyInProgress);
            }
            let stored = alloc.stored_count();
            if stored < alloc.total_chunks {
                return Err(ChunkStoreError::IncompleteUpload {
                    missing: alloc.total_chunks - stored,
                    total: alloc.total_chunks,
                });
            }
            let received = alloc.stored_bytes();
            if received != alloc.declared_size {
                return Err(ChunkStoreError::SizeMismatch {
                    declared: alloc.declared_size,
                    actual: received,
                });
            }
            alloc.phase = Phase::Assembling;
            alloc.total_chunks
        };

        match self.concatenate(upload_id, total_chunks, check).await {
            Ok(artifact) => {
                self.allocations.remove(&upload_id);
                if let Err(e) = self.store.delete_prefix(&staging_prefix(upload_id)).await {
                    warn!(error = %e, "failed to reclaim staged chunks after assembly");
                }
                debug!(size = artifact.size, key = %artifact.key, "artifact assembled");
                Ok(artifact)
            }
            Err(e) => {
                self.set_phase(upload_id, Phase::Open);
                Err(e)
            }
        }
    }

    #[instrument(skip(self), fields(upload_id = %upload_id))]
    async fn discard(&self, upload_id: UploadId) -> ChunkStoreResult<()> {
        self.allocations.remove(&upload_id);
        let removed = self.store.delete_prefix(&staging_prefix(upload_id)).await?;
        debug!(removed, "staging discarded");
        Ok(())
    }

    #[instrument(skip(self), fields(upload_id = %upload_id))]
    async fn remove_artifact(&self, upload_id: UploadId) -> ChunkStoreResult<()> {
        match self.store.delete(&artifact_key(upload_id)).await {
            Ok(()) | Err(StorageError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn records(&self, upload_id: UploadId) -> ChunkStoreResult<Vec<ChunkRecord>> {
        self.allocations
            .get(&upload_id)
            .map(|alloc| alloc.records(upload_id))
            .ok_or(ChunkStoreError::NotAllocated(upload_id))
    }
}
