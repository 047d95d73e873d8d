//! Server test utilities.

use quire_core::config::AppConfig;
use quire_engine::{DryRunGenerator, Generator};
use quire_metadata::{MemoryStore, MetadataStore};
use quire_server::{AppState, create_router};
use quire_storage::{MemoryBackend, ObjectStore};
use std::sync::Arc;

/// A test server wrapper with in-memory stores.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
}

#[allow(dead_code)]
impl TestServer {
    /// Test defaults with the dry-run generator.
    pub fn new() -> Self {
        Self::build(AppConfig::for_testing(), Arc::new(DryRunGenerator::new()))
    }

    /// Test defaults with a custom generator.
    pub fn with_generator(generator: Arc<dyn Generator>) -> Self {
        Self::build(AppConfig::for_testing(), generator)
    }

    /// Test defaults with config modifications.
    pub fn with_config<F>(modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        let mut config = AppConfig::for_testing();
        modifier(&mut config);
        Self::build(config, Arc::new(DryRunGenerator::new()))
    }

    fn build(config: AppConfig, generator: Arc<dyn Generator>) -> Self {
        quire_server::metrics::register_metrics();
        let storage: Arc<dyn ObjectStore> = Arc::new(MemoryBackend::new());
        let metadata: Arc<dyn MetadataStore> = Arc::new(MemoryStore::new());
        let state = AppState::new(config, storage, metadata, generator);
        let router = create_router(state.clone());
        Self { router, state }
    }
}
