//! The remote generation operation.
//!
//! The orchestrator treats generation as an opaque fallible call. Failures
//! are classified as transient (worth retrying) or fatal.

mod dry_run;
mod http;

pub use dry_run::DryRunGenerator;
pub use http::HttpGenerator;

use crate::inputs::Document;
use async_trait::async_trait;
use quire_core::config::GenerationConfig;
use quire_core::{TaskId, TaskKind};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Generation failures.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("transient generation failure: {0}")]
    Transient(String),

    #[error("generation failed: {0}")]
    Fatal(String),
}

impl GenerationError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// One step of a task's workflow.
#[derive(Clone, Debug, Serialize)]
pub struct GenerationRequest {
    pub task_id: TaskId,
    pub kind: TaskKind,
    /// 1-based position of this step.
    pub step: u32,
    pub total_steps: u32,
    pub document: Document,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub options: serde_json::Map<String, serde_json::Value>,
}

/// Remote generation operation.
#[async_trait]
pub trait Generator: Send + Sync + 'static {
    /// Produce the text for one step.
    async fn invoke(&self, request: &GenerationRequest) -> Result<String, GenerationError>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Build the generator described by `config`.
///
/// `connect_timeout` bounds connection setup; per-call deadlines are applied
/// by the caller.
pub fn from_config(
    config: &GenerationConfig,
    connect_timeout: Duration,
) -> Result<Arc<dyn Generator>, GenerationError> {
    match config {
        GenerationConfig::Http {
            endpoint,
            api_key,
            model,
        } => {
            let generator =
                HttpGenerator::new(endpoint, api_key.clone(), model.clone(), connect_timeout)?;
            Ok(Arc::new(generator))
        }
        GenerationConfig::DryRun => Ok(Arc::new(DryRunGenerator::new())),
    }
}
