//! Object storage abstraction and chunk staging for Quire.
//!
//! This crate provides:
//! - A durable key/bytes store with atomic writes (`ObjectStore`)
//! - Backends: local filesystem and in-memory
//! - Chunk staging and ordered assembly of uploads (`ChunkStore`)

pub mod backends;
pub mod chunk_store;
pub mod error;
pub mod traits;

pub use backends::{filesystem::FilesystemBackend, memory::MemoryBackend};
pub use chunk_store::{
    AcceptAll, AssembledArtifact, AssemblyCheck, ChunkAllocation, ChunkStore, ChunkStoreError,
    ChunkStoreResult, StagedChunkStore,
};
pub use error::{StorageError, StorageResult};
pub use traits::{ByteStream, ObjectMeta, ObjectStore, StreamingUpload};

use quire_core::config::StorageConfig;
use std::sync::Arc;

/// Create an object store from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn ObjectStore>> {
    config.validate().map_err(StorageError::Config)?;

    match config {
        StorageConfig::Filesystem { path } => {
            let backend = FilesystemBackend::new(path).await?;
            Ok(Arc::new(backend))
        }
        StorageConfig::Memory => Ok(Arc::new(MemoryBackend::new())),
    }
}
