//! Application state shared across handlers.

use quire_core::config::AppConfig;
use quire_engine::{Generator, ProgressBus, TaskOrchestrator, UploadSessionManager};
use quire_metadata::MetadataStore;
use quire_storage::{ChunkStore, ObjectStore, StagedChunkStore};
use std::sync::Arc;

/// Application state.
#[derive(Clone)]
pub struct AppState {
    /// Configuration.
    pub config: Arc<AppConfig>,
    /// Storage backend for chunks, artifacts and task outputs.
    pub storage: Arc<dyn ObjectStore>,
    /// Upload session and task records.
    pub metadata: Arc<dyn MetadataStore>,
    /// Upload lifecycle.
    pub uploads: Arc<UploadSessionManager>,
    /// Task lifecycle and progress streams.
    pub tasks: TaskOrchestrator,
}

impl AppState {
    /// Wire the engine components over the given stores.
    pub fn new(
        config: AppConfig,
        storage: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
        generator: Arc<dyn Generator>,
    ) -> Self {
        let chunks: Arc<dyn ChunkStore> = Arc::new(StagedChunkStore::new(
            storage.clone(),
            config.uploads.chunk_write_timeout(),
        ));
        let uploads = Arc::new(UploadSessionManager::new(
            metadata.clone(),
            chunks,
            config.uploads.clone(),
        ));
        let tasks = TaskOrchestrator::new(
            metadata.clone(),
            storage.clone(),
            Arc::new(ProgressBus::new()),
            generator,
            config.tasks.clone(),
        );

        Self {
            config: Arc::new(config),
            storage,
            metadata,
            uploads,
            tasks,
        }
    }
}
