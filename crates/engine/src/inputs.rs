//! Resolution of task input references.

use crate::error::{TaskError, TaskResult};
use quire_core::{InputRef, TaskOutput, TaskStage, UploadState};
use quire_metadata::MetadataStore;
use quire_storage::ObjectStore;
use serde::Serialize;
use std::sync::Arc;

/// A document handed to the generation operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Document {
    /// The input reference the document came from.
    pub source: String,
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    /// Decoded text. `None` for binary formats, which are described by
    /// name, type and size only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl Document {
    pub fn text(
        source: impl Into<String>,
        name: impl Into<String>,
        mime_type: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        let text = text.into();
        Self {
            source: source.into(),
            name: name.into(),
            mime_type: mime_type.into(),
            size: text.len() as u64,
            text: Some(text),
        }
    }

    pub fn binary(
        source: impl Into<String>,
        name: impl Into<String>,
        mime_type: impl Into<String>,
        size: u64,
    ) -> Self {
        Self {
            source: source.into(),
            name: name.into(),
            mime_type: mime_type.into(),
            size,
            text: None,
        }
    }
}

fn is_textual(mime: &str) -> bool {
    let mime = quire_core::mime::essence(mime);
    mime.starts_with("text/") || mime == "application/json"
}

/// Turns input references into documents.
///
/// Uploads must be Completed; tasks must be Completed with a stored output.
#[derive(Clone)]
pub struct InputResolver {
    metadata: Arc<dyn MetadataStore>,
    storage: Arc<dyn ObjectStore>,
}

impl InputResolver {
    pub fn new(metadata: Arc<dyn MetadataStore>, storage: Arc<dyn ObjectStore>) -> Self {
        Self { metadata, storage }
    }

    /// Check every reference without reading content.
    pub async fn validate(&self, refs: &[InputRef]) -> TaskResult<()> {
        for reference in refs {
            self.check(*reference).await?;
        }
        Ok(())
    }

    async fn check(&self, reference: InputRef) -> TaskResult<()> {
        match reference {
            InputRef::Upload(upload_id) => {
                let session = self
                    .metadata
                    .get_session(upload_id)
                    .await?
                    .ok_or_else(|| TaskError::InvalidInput(format!("{reference} does not exist")))?;
                if session.state != UploadState::Completed || session.artifact.is_none() {
                    return Err(TaskError::InvalidInput(format!(
                        "{reference} is {}, not completed",
                        session.state
                    )));
                }
            }
            InputRef::Task(task_id) => {
                let task = self
                    .metadata
                    .get_task(task_id)
                    .await?
                    .ok_or_else(|| TaskError::InvalidInput(format!("{reference} does not exist")))?;
                if task.stage != TaskStage::Completed || task.output_ref.is_none() {
                    return Err(TaskError::InvalidInput(format!(
                        "{reference} is {}, not completed",
                        task.stage
                    )));
                }
            }
        }
        Ok(())
    }

    /// Load the document behind a reference.
    pub async fn load(&self, reference: InputRef) -> TaskResult<Document> {
        let source = reference.to_string();
        match reference {
            InputRef::Upload(upload_id) => {
                let artifact = self
                    .metadata
                    .get_session(upload_id)
                    .await?
                    .filter(|s| s.state == UploadState::Completed)
                    .and_then(|s| s.artifact)
                    .ok_or_else(|| {
                        TaskError::InvalidInput(format!("{source} is no longer available"))
                    })?;
                if !is_textual(&artifact.mime_type) {
                    return Ok(Document::binary(
                        source,
                        artifact.filename,
                        artifact.mime_type,
                        artifact.size,
                    ));
                }
                let bytes = self.storage.get(&artifact.key).await?;
                let text = String::from_utf8(bytes.to_vec()).map_err(|e| {
                    TaskError::InvalidInput(format!("{source} is not valid UTF-8: {e}"))
                })?;
                Ok(Document::text(
                    source,
                    artifact.filename,
                    artifact.mime_type,
                    text,
                ))
            }
            InputRef::Task(task_id) => {
                let key = self
                    .metadata
                    .get_task(task_id)
                    .await?
                    .filter(|t| t.stage == TaskStage::Completed)
                    .and_then(|t| t.output_ref)
                    .ok_or_else(|| {
                        TaskError::InvalidInput(format!("{source} is no longer available"))
                    })?;
                let bytes = self.storage.get(&key).await?;
                let output: TaskOutput = serde_json::from_slice(&bytes)
                    .map_err(|e| TaskError::InvalidOutput(format!("{key}: {e}")))?;
                Ok(Document::text(
                    source,
                    format!("{} output {}", output.kind, output.task_id),
                    "text/markdown",
                    output.content,
                ))
            }
        }
    }
}
