//! Task orchestration: Initializing -> Processing -> Finalizing -> Completed.
//!
//! Each task runs on its own spawned future and is the only writer of its
//! progress. Stage changes are compare-and-set transitions in the metadata
//! store, so a concurrent cancel and a stage advance can never both apply.
//! Cancellation is cooperative: the worker checks its token before every
//! suspend point, and an in-flight generation call is allowed to finish.
//!
//! Visible progress is mapped onto fixed bands per stage (see
//! [`TaskStage::band`]).

use crate::error::{TaskError, TaskResult};
use crate::generator::{GenerationError, GenerationRequest, Generator};
use crate::inputs::{Document, InputResolver};
use crate::progress::{ProgressBus, ProgressError};
use crate::retry::RetryPolicy;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use futures::stream::BoxStream;
use quire_core::config::TaskConfig;
use quire_core::{
    InputRef, OutputSection, ProgressEvent, ProgressSnapshot, ProgressUpdate, Task, TaskId,
    TaskKind, TaskOptions, TaskOutput, TaskStage,
};
use quire_metadata::{MetadataError, MetadataStore, TaskUpdate, Transition};
use quire_storage::{ObjectStore, StorageError};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Tasks examined per reap pass.
const REAP_BATCH: usize = 500;

/// Why a running task stopped before completing.
enum Halt {
    /// Cancelled, or another writer moved the task to a terminal stage.
    Stopped,
    Failed(String),
}

impl From<MetadataError> for Halt {
    fn from(err: MetadataError) -> Self {
        Self::Failed(format!("failed to record task state: {err}"))
    }
}

/// Runs generate and refine tasks.
#[derive(Clone)]
pub struct TaskOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    metadata: Arc<dyn MetadataStore>,
    storage: Arc<dyn ObjectStore>,
    bus: Arc<ProgressBus>,
    generator: Arc<dyn Generator>,
    resolver: InputResolver,
    retry: RetryPolicy,
    config: TaskConfig,
    running: DashMap<TaskId, CancellationToken>,
}

impl TaskOrchestrator {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        storage: Arc<dyn ObjectStore>,
        bus: Arc<ProgressBus>,
        generator: Arc<dyn Generator>,
        config: TaskConfig,
    ) -> Self {
        let resolver = InputResolver::new(metadata.clone(), storage.clone());
        let retry = RetryPolicy::from(&config.retry);
        Self {
            inner: Arc::new(Inner {
                metadata,
                storage,
                bus,
                generator,
                resolver,
                retry,
                config,
                running: DashMap::new(),
            }),
        }
    }

    pub fn bus(&self) -> &Arc<ProgressBus> {
        &self.inner.bus
    }

    pub fn config(&self) -> &TaskConfig {
        &self.inner.config
    }

    /// Number of tasks with a live worker.
    pub fn running(&self) -> usize {
        self.inner.running.len()
    }

    /// Validate inputs, record the task and schedule it.
    ///
    /// Returns as soon as the task is recorded; the work runs in the
    /// background.
    pub async fn start(
        &self,
        kind: TaskKind,
        input_refs: Vec<InputRef>,
        options: TaskOptions,
    ) -> TaskResult<Task> {
        if input_refs.is_empty() {
            return Err(TaskError::InvalidInput(
                "at least one input reference is required".to_string(),
            ));
        }
        if kind == TaskKind::Refine {
            if input_refs.len() != 1 {
                return Err(TaskError::InvalidInput(format!(
                    "refine takes exactly one input, got {}",
                    input_refs.len()
                )));
            }
            if options.passes == Some(0) {
                return Err(TaskError::InvalidInput(
                    "passes must be at least 1".to_string(),
                ));
            }
        }
        self.inner.resolver.validate(&input_refs).await?;

        let task = Task::new(kind, input_refs, options);
        let task_id = task.id;
        self.inner.metadata.create_task(&task).await?;
        self.inner.bus.open(task_id);
        self.inner.bus.publish(
            task_id,
            ProgressUpdate::new(TaskStage::Initializing, 0, task.message.clone()),
        )?;

        let token = CancellationToken::new();
        self.inner.running.insert(task_id, token.clone());

        let inner = self.inner.clone();
        let worker = task.clone();
        tokio::spawn(
            async move { inner.run(worker, token).await }
                .instrument(info_span!("task", task_id = %task_id, kind = %kind)),
        );

        info!(task_id = %task_id, kind = %kind, inputs = task.input_refs.len(), "task started");
        Ok(task)
    }

    /// Request cooperative cancellation.
    ///
    /// Only Initializing and Processing tasks can be cancelled. On success the
    /// task is Cancelled and its terminal event has been published.
    pub async fn cancel(&self, task_id: TaskId) -> TaskResult<Task> {
        let reason = "cancelled by request";
        let transition = self
            .inner
            .metadata
            .transition_task(
                task_id,
                &[TaskStage::Initializing, TaskStage::Processing],
                TaskStage::Cancelled,
                TaskUpdate {
                    message: Some(reason.to_string()),
                    failure_reason: Some(reason.to_string()),
                    ..TaskUpdate::default()
                },
                OffsetDateTime::now_utc(),
            )
            .await
            .map_err(|e| match e {
                MetadataError::NotFound(_) => TaskError::NotFound(task_id),
                other => other.into(),
            })?;

        match transition {
            Transition::Applied(task) => {
                if let Some((_, token)) = self.inner.running.remove(&task_id) {
                    token.cancel();
                }
                let update = ProgressUpdate::new(TaskStage::Cancelled, task.progress_percent, reason)
                    .with_attempt(task.attempt)
                    .with_reason(reason);
                if let Err(e) = self.inner.bus.publish(task_id, update) {
                    warn!(task_id = %task_id, error = %e, "failed to publish cancellation");
                }
                info!(task_id = %task_id, "task cancelled");
                Ok(task)
            }
            Transition::Rejected(task) if task.stage == TaskStage::Finalizing => {
                Err(TaskError::TooLateToCancel(task_id))
            }
            Transition::Rejected(task) => Err(TaskError::AlreadyTerminal {
                task_id,
                stage: task.stage,
            }),
        }
    }

    /// Current task record.
    pub async fn status(&self, task_id: TaskId) -> TaskResult<Task> {
        self.inner
            .metadata
            .get_task(task_id)
            .await?
            .ok_or(TaskError::NotFound(task_id))
    }

    /// Latest published progress.
    pub fn progress(&self, task_id: TaskId) -> TaskResult<ProgressSnapshot> {
        self.inner
            .bus
            .poll(task_id)
            .ok_or(TaskError::NotFound(task_id))
    }

    /// Progress events from `from_sequence` on, ending after the terminal one.
    pub async fn events(
        &self,
        task_id: TaskId,
        from_sequence: u64,
    ) -> TaskResult<BoxStream<'static, ProgressEvent>> {
        self.status(task_id).await?;
        self.inner
            .bus
            .subscribe(task_id, from_sequence)
            .map(StreamExt::boxed)
            .map_err(|e| match e {
                ProgressError::UnknownTask(id) => TaskError::NotFound(id),
                other => other.into(),
            })
    }

    /// Stored output of a Completed task.
    pub async fn output(&self, task_id: TaskId) -> TaskResult<TaskOutput> {
        let task = self.status(task_id).await?;
        match (task.stage, task.output_ref) {
            (TaskStage::Completed, Some(key)) => {
                let bytes = self.inner.storage.get(&key).await?;
                serde_json::from_slice(&bytes)
                    .map_err(|e| TaskError::InvalidOutput(format!("{key}: {e}")))
            }
            (TaskStage::Failed, _) => Err(TaskError::TaskFailed(
                task.failure_reason
                    .unwrap_or_else(|| "unknown failure".to_string()),
            )),
            (stage, _) => Err(TaskError::NotCompleted { task_id, stage }),
        }
    }

    /// Remove terminal tasks finished more than the retention window before
    /// `now`: the record, the event log and any stored output.
    pub async fn reap(&self, now: OffsetDateTime) -> TaskResult<usize> {
        let retention = self.inner.config.retention();
        let finished = self
            .inner
            .metadata
            .list_finished_tasks(now - retention, REAP_BATCH)
            .await?;

        let mut reaped = 0;
        for task in finished.into_iter().filter(|t| t.is_reapable(now, retention)) {
            if let Some(key) = &task.output_ref {
                match self.inner.storage.delete(key).await {
                    Ok(()) | Err(StorageError::NotFound(_)) => {}
                    Err(e) => {
                        warn!(task_id = %task.id, error = %e, "failed to delete task output");
                        continue;
                    }
                }
            }
            self.inner.bus.remove(task.id);
            self.inner.metadata.delete_task(task.id).await?;
            debug!(task_id = %task.id, stage = %task.stage, "task reaped");
            reaped += 1;
        }
        Ok(reaped)
    }

    /// Cancel every running worker's token. Used on shutdown.
    pub fn shutdown(&self) {
        for entry in self.inner.running.iter() {
            entry.value().cancel();
        }
    }
}

impl Inner {
    async fn run(self: Arc<Self>, task: Task, token: CancellationToken) {
        let task_id = task.id;
        match self.execute(&task, &token).await {
            Ok(()) => info!("task completed"),
            Err(Halt::Stopped) => debug!("task stopped"),
            Err(Halt::Failed(reason)) => self.fail(task_id, reason).await,
        }
        self.running.remove(&task_id);
    }

    async fn execute(&self, task: &Task, token: &CancellationToken) -> Result<(), Halt> {
        let documents = self.initialize(task, token).await?;

        self.advance(task.id, TaskStage::Initializing, TaskStage::Processing, "processing")
            .await?;
        let sections = match task.kind {
            TaskKind::Generate => self.generate(task, documents, token).await?,
            TaskKind::Refine => self.refine(task, documents, token).await?,
        };

        if token.is_cancelled() {
            return Err(Halt::Stopped);
        }
        self.advance(task.id, TaskStage::Processing, TaskStage::Finalizing, "finalizing")
            .await?;
        self.finalize(task, sections).await
    }

    /// Resolve every input, reporting progress through the Initializing band.
    async fn initialize(
        &self,
        task: &Task,
        token: &CancellationToken,
    ) -> Result<Vec<Document>, Halt> {
        let total = task.input_refs.len() as u32;
        let mut documents = Vec::with_capacity(task.input_refs.len());
        for (i, reference) in task.input_refs.iter().enumerate() {
            if token.is_cancelled() {
                return Err(Halt::Stopped);
            }
            let document = self
                .resolver
                .load(*reference)
                .await
                .map_err(|e| Halt::Failed(format!("failed to load {reference}: {e}")))?;
            documents.push(document);

            let done = i as u32 + 1;
            // The band's upper bound belongs to the Processing transition.
            let percent = TaskStage::Initializing.scale(done, total + 1);
            self.report(
                task.id,
                TaskStage::Initializing,
                percent,
                format!("resolved input {done} of {total}"),
                0,
            )
            .await?;
        }
        Ok(documents)
    }

    async fn generate(
        &self,
        task: &Task,
        documents: Vec<Document>,
        token: &CancellationToken,
    ) -> Result<Vec<OutputSection>, Halt> {
        let total = documents.len() as u32;
        let mut sections = Vec::with_capacity(documents.len());
        for (i, document) in documents.into_iter().enumerate() {
            let step = i as u32 + 1;
            let source = document.source.clone();
            let content = self.step(task, step, total, document, token).await?;
            sections.push(OutputSection { source, content });
        }
        Ok(sections)
    }

    async fn refine(
        &self,
        task: &Task,
        mut documents: Vec<Document>,
        token: &CancellationToken,
    ) -> Result<Vec<OutputSection>, Halt> {
        let mut document = documents
            .pop()
            .ok_or_else(|| Halt::Failed("refine task has no input".to_string()))?;
        let total = task
            .options
            .passes
            .unwrap_or(1)
            .min(self.config.max_refine_passes)
            .max(1);
        let source = document.source.clone();

        let mut content = String::new();
        for step in 1..=total {
            content = self.step(task, step, total, document.clone(), token).await?;
            document.text = Some(content.clone());
            document.size = content.len() as u64;
        }
        Ok(vec![OutputSection { source, content }])
    }

    /// Run one generation step with retries, then report its completion.
    async fn step(
        &self,
        task: &Task,
        step: u32,
        total: u32,
        document: Document,
        token: &CancellationToken,
    ) -> Result<String, Halt> {
        let request = GenerationRequest {
            task_id: task.id,
            kind: task.kind,
            step,
            total_steps: total,
            document,
            instructions: task.options.instructions.clone(),
            options: task.options.extra.clone(),
        };
        let content = self.invoke_with_retry(&request, token).await?;
        if token.is_cancelled() {
            return Err(Halt::Stopped);
        }
        self.report(
            task.id,
            TaskStage::Processing,
            TaskStage::Processing.scale(step, total),
            format!("completed step {step} of {total}"),
            0,
        )
        .await?;
        Ok(content)
    }

    async fn invoke_with_retry(
        &self,
        request: &GenerationRequest,
        token: &CancellationToken,
    ) -> Result<String, Halt> {
        let timeout = self.config.generation_timeout();
        let progress = TaskStage::Processing.scale(request.step - 1, request.total_steps);
        let mut attempt = 1;
        self.checkpoint_attempt(request.task_id, attempt).await?;

        loop {
            if token.is_cancelled() {
                return Err(Halt::Stopped);
            }
            let err = match tokio::time::timeout(timeout, self.generator.invoke(request)).await {
                Ok(Ok(content)) => return Ok(content),
                Ok(Err(e)) => e,
                Err(_) => GenerationError::Transient(format!("timed out after {timeout:?}")),
            };

            if !err.is_transient() {
                return Err(Halt::Failed(err.to_string()));
            }
            if !self.retry.should_retry(attempt) {
                return Err(Halt::Failed(format!(
                    "{err} (gave up after {attempt} attempts)"
                )));
            }

            let delay = self.retry.backoff(attempt);
            attempt += 1;
            warn!(
                step = request.step,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying generation step"
            );
            self.report(
                request.task_id,
                TaskStage::Processing,
                progress,
                format!(
                    "retrying step {} of {} (attempt {attempt}): {err}",
                    request.step, request.total_steps
                ),
                attempt,
            )
            .await?;

            tokio::select! {
                _ = token.cancelled() => return Err(Halt::Stopped),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn finalize(&self, task: &Task, sections: Vec<OutputSection>) -> Result<(), Halt> {
        let content = match task.kind {
            TaskKind::Generate => sections
                .iter()
                .map(|s| s.content.trim())
                .collect::<Vec<_>>()
                .join("\n\n"),
            TaskKind::Refine => sections
                .last()
                .map(|s| s.content.clone())
                .unwrap_or_default(),
        };
        let output = TaskOutput {
            task_id: task.id,
            kind: task.kind,
            content,
            sections,
            created_at: OffsetDateTime::now_utc(),
        };
        let key = TaskOutput::object_key(task.id);
        let body = serde_json::to_vec(&output)
            .map_err(|e| Halt::Failed(format!("failed to encode output: {e}")))?;
        self.storage
            .put(&key, Bytes::from(body))
            .await
            .map_err(|e| Halt::Failed(format!("failed to store output: {e}")))?;

        let transition = self
            .metadata
            .transition_task(
                task.id,
                &[TaskStage::Finalizing],
                TaskStage::Completed,
                TaskUpdate::progress(100, "completed").with_output(key.clone()),
                OffsetDateTime::now_utc(),
            )
            .await?;
        match transition {
            Transition::Applied(done) => {
                self.publish(
                    task.id,
                    ProgressUpdate::new(TaskStage::Completed, 100, "completed")
                        .with_attempt(done.attempt),
                )?;
                Ok(())
            }
            Transition::Rejected(_) => {
                let _ = self.storage.delete(&key).await;
                Err(Halt::Stopped)
            }
        }
    }

    /// Move to `to`, starting it at the bottom of its band.
    async fn advance(
        &self,
        task_id: TaskId,
        from: TaskStage,
        to: TaskStage,
        message: &str,
    ) -> Result<(), Halt> {
        let percent = to.band().0;
        let transition = self
            .metadata
            .transition_task(
                task_id,
                &[from],
                to,
                TaskUpdate::progress(percent, message),
                OffsetDateTime::now_utc(),
            )
            .await?;
        match transition {
            Transition::Applied(task) => {
                info!(stage = %to, "task stage changed");
                self.publish(
                    task_id,
                    ProgressUpdate::new(to, percent, message).with_attempt(task.attempt),
                )
            }
            Transition::Rejected(_) => Err(Halt::Stopped),
        }
    }

    /// Record progress on the task and publish it.
    async fn report(
        &self,
        task_id: TaskId,
        stage: TaskStage,
        percent: u8,
        message: String,
        attempt: u32,
    ) -> Result<(), Halt> {
        let mut update = TaskUpdate::progress(percent, message.clone());
        if attempt > 0 {
            update = update.with_attempt(attempt);
        }
        let task = match self
            .metadata
            .update_task(task_id, update, OffsetDateTime::now_utc())
            .await?
        {
            Transition::Applied(task) => task,
            Transition::Rejected(_) => return Err(Halt::Stopped),
        };
        self.publish(
            task_id,
            ProgressUpdate::new(stage, percent, message).with_attempt(task.attempt),
        )
    }

    /// Record the attempt number of a step that is about to run.
    async fn checkpoint_attempt(&self, task_id: TaskId, attempt: u32) -> Result<(), Halt> {
        let update = TaskUpdate {
            attempt: Some(attempt),
            ..TaskUpdate::default()
        };
        match self
            .metadata
            .update_task(task_id, update, OffsetDateTime::now_utc())
            .await?
        {
            Transition::Applied(_) => Ok(()),
            Transition::Rejected(_) => Err(Halt::Stopped),
        }
    }

    fn publish(&self, task_id: TaskId, update: ProgressUpdate) -> Result<(), Halt> {
        match self.bus.publish(task_id, update) {
            Ok(_) => Ok(()),
            Err(ProgressError::Closed(_)) => Err(Halt::Stopped),
            Err(e) => Err(Halt::Failed(e.to_string())),
        }
    }

    async fn fail(&self, task_id: TaskId, reason: String) {
        let transition = self
            .metadata
            .transition_task(
                task_id,
                &[
                    TaskStage::Initializing,
                    TaskStage::Processing,
                    TaskStage::Finalizing,
                ],
                TaskStage::Failed,
                TaskUpdate {
                    message: Some("failed".to_string()),
                    failure_reason: Some(reason.clone()),
                    ..TaskUpdate::default()
                },
                OffsetDateTime::now_utc(),
            )
            .await;
        match transition {
            Ok(Transition::Applied(task)) => {
                warn!(%reason, "task failed");
                let update = ProgressUpdate::new(TaskStage::Failed, task.progress_percent, "failed")
                    .with_attempt(task.attempt)
                    .with_reason(reason);
                if let Err(e) = self.bus.publish(task_id, update) {
                    warn!(error = %e, "failed to publish task failure");
                }
            }
            Ok(Transition::Rejected(task)) => {
                debug!(stage = %task.stage, "task already terminal, failure not recorded");
            }
            Err(e) => error!(error = %e, %reason, "failed to record task failure"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::DryRunGenerator;
    use async_trait::async_trait;
    use futures::StreamExt;
    use quire_core::config::RetryConfig;
    use quire_core::{ArtifactRef, ContentHash, UploadSession, UploadState};
    use quire_metadata::{MemoryStore, SessionUpdate, TaskRepo, UploadRepo};
    use quire_storage::MemoryBackend;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Replays scripted results, then succeeds with `"step N"`.
    #[derive(Default)]
    struct Scripted {
        script: Mutex<VecDeque<Result<String, GenerationError>>>,
        delay: Duration,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(script: Vec<Result<String, GenerationError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                ..Self::default()
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl Generator for Scripted {
        async fn invoke(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok(format!("step {}", request.step)))
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    struct Fixture {
        metadata: Arc<MemoryStore>,
        storage: Arc<MemoryBackend>,
        orchestrator: TaskOrchestrator,
    }

    fn config(max_attempts: u32) -> TaskConfig {
        TaskConfig {
            retry: RetryConfig {
                max_attempts,
                initial_backoff_ms: 1,
                backoff_multiplier: 2.0,
                max_backoff_ms: 5,
            },
            generation_timeout_secs: 5,
            ..TaskConfig::default()
        }
    }

    fn fixture_with(generator: Arc<dyn Generator>, config: TaskConfig) -> Fixture {
        let metadata = Arc::new(MemoryStore::new());
        let storage = Arc::new(MemoryBackend::new());
        let orchestrator = TaskOrchestrator::new(
            metadata.clone(),
            storage.clone(),
            Arc::new(ProgressBus::new()),
            generator,
            config,
        );
        Fixture {
            metadata,
            storage,
            orchestrator,
        }
    }

    fn fixture(generator: Scripted) -> Fixture {
        fixture_with(Arc::new(generator), config(3))
    }

    async fn upload(f: &Fixture, filename: &str, data: &str) -> InputRef {
        let session = UploadSession::new(filename, data.len() as u64, "text/plain", 1);
        f.metadata.create_session(&session).await.unwrap();
        let key = format!("artifacts/{}", session.id);
        f.storage
            .put(&key, Bytes::copy_from_slice(data.as_bytes()))
            .await
            .unwrap();
        let artifact = ArtifactRef {
            upload_id: session.id,
            key,
            filename: filename.to_string(),
            mime_type: "text/plain".to_string(),
            size: data.len() as u64,
            sha256: ContentHash::compute(data.as_bytes()),
        };
        f.metadata
            .transition_session(
                session.id,
                &[UploadState::Initialized],
                UploadState::Completed,
                SessionUpdate::completed(artifact),
                OffsetDateTime::now_utc(),
            )
            .await
            .unwrap();
        InputRef::Upload(session.id)
    }

    async fn run_to_end(f: &Fixture, task_id: TaskId) -> Vec<ProgressEvent> {
        let stream = f.orchestrator.events(task_id, 0).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), stream.collect::<Vec<_>>())
            .await
            .expect("task did not reach a terminal stage")
    }

    fn assert_well_ordered(events: &[ProgressEvent]) {
        for pair in events.windows(2) {
            assert!(pair[1].sequence > pair[0].sequence);
            assert!(pair[1].progress_percent >= pair[0].progress_percent);
        }
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert!(events.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn test_generate_runs_through_stages() {
        let f = fixture(Scripted::default());
        let a = upload(&f, "a.txt", "alpha").await;
        let b = upload(&f, "b.txt", "beta").await;

        let task = f
            .orchestrator
            .start(TaskKind::Generate, vec![a, b], TaskOptions::default())
            .await
            .unwrap();
        assert_eq!(task.stage, TaskStage::Initializing);

        let events = run_to_end(&f, task.id).await;
        assert_well_ordered(&events);
        let stages: Vec<_> = events.iter().map(|e| e.stage).collect();
        for stage in [
            TaskStage::Initializing,
            TaskStage::Processing,
            TaskStage::Finalizing,
            TaskStage::Completed,
        ] {
            assert!(stages.contains(&stage), "missing {stage}");
        }
        assert_eq!(events.last().unwrap().progress_percent, 100);

        let output = f.orchestrator.output(task.id).await.unwrap();
        assert_eq!(output.sections.len(), 2);
        assert_eq!(output.sections[0].source, a.to_string());
        assert_eq!(output.content, "step 1\n\nstep 2");

        let status = f.orchestrator.status(task.id).await.unwrap();
        assert_eq!(status.stage, TaskStage::Completed);
        assert_eq!(status.output_ref, Some(TaskOutput::object_key(task.id)));
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let f = fixture(Scripted::new(vec![Err(GenerationError::Transient(
            "busy".to_string(),
        ))]));
        let input = upload(&f, "a.txt", "alpha").await;

        let task = f
            .orchestrator
            .start(TaskKind::Generate, vec![input], TaskOptions::default())
            .await
            .unwrap();
        let events = run_to_end(&f, task.id).await;

        assert_well_ordered(&events);
        assert_eq!(events.last().unwrap().stage, TaskStage::Completed);
        assert!(events.iter().any(|e| e.attempt == 2 && e.message.contains("retrying")));
        assert_eq!(f.orchestrator.status(task.id).await.unwrap().attempt, 2);
    }

    #[tokio::test]
    async fn test_fatal_failure_fails_task() {
        let f = fixture(Scripted::new(vec![Err(GenerationError::Fatal(
            "prompt rejected".to_string(),
        ))]));
        let input = upload(&f, "a.txt", "alpha").await;

        let task = f
            .orchestrator
            .start(TaskKind::Generate, vec![input], TaskOptions::default())
            .await
            .unwrap();
        let events = run_to_end(&f, task.id).await;

        let last = events.last().unwrap();
        assert_eq!(last.stage, TaskStage::Failed);
        assert!(last.reason.as_deref().unwrap().contains("prompt rejected"));

        let err = f.orchestrator.output(task.id).await.unwrap_err();
        assert!(matches!(err, TaskError::TaskFailed(reason) if reason.contains("prompt rejected")));
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let generator = Scripted::new(vec![
            Err(GenerationError::Transient("busy".to_string())),
            Err(GenerationError::Transient("still busy".to_string())),
        ]);
        let f = fixture_with(Arc::new(generator), config(2));
        let input = upload(&f, "a.txt", "alpha").await;

        let task = f
            .orchestrator
            .start(TaskKind::Generate, vec![input], TaskOptions::default())
            .await
            .unwrap();
        let events = run_to_end(&f, task.id).await;

        let last = events.last().unwrap();
        assert_eq!(last.stage, TaskStage::Failed);
        assert!(last.reason.as_deref().unwrap().contains("gave up after 2 attempts"));
    }

    #[tokio::test]
    async fn test_cancel_running_task() {
        let f = fixture(Scripted::slow(Duration::from_millis(200)));
        let input = upload(&f, "a.txt", "alpha").await;

        let task = f
            .orchestrator
            .start(TaskKind::Generate, vec![input], TaskOptions::default())
            .await
            .unwrap();
        let cancelled = f.orchestrator.cancel(task.id).await.unwrap();
        assert_eq!(cancelled.stage, TaskStage::Cancelled);

        let events = run_to_end(&f, task.id).await;
        assert_well_ordered(&events);
        assert_eq!(events.last().unwrap().stage, TaskStage::Cancelled);

        let err = f.orchestrator.cancel(task.id).await.unwrap_err();
        assert!(matches!(
            err,
            TaskError::AlreadyTerminal {
                stage: TaskStage::Cancelled,
                ..
            }
        ));

        // The in-flight call finishes without reviving the task.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let status = f.orchestrator.status(task.id).await.unwrap();
        assert_eq!(status.stage, TaskStage::Cancelled);
        assert_eq!(f.orchestrator.running(), 0);
    }

    #[tokio::test]
    async fn test_cancel_during_retry_backoff() {
        let generator = Arc::new(Scripted::new(vec![Err(GenerationError::Transient(
            "busy".to_string(),
        ))]));
        let mut slow_retry = config(3);
        slow_retry.retry.initial_backoff_ms = 60_000;
        slow_retry.retry.max_backoff_ms = 60_000;
        let f = fixture_with(generator.clone(), slow_retry);
        let input = upload(&f, "a.txt", "alpha").await;

        let task = f
            .orchestrator
            .start(TaskKind::Generate, vec![input], TaskOptions::default())
            .await
            .unwrap();
        let mut stream = f.orchestrator.events(task.id, 0).await.unwrap();
        let retrying = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = stream.next().await {
                if event.message.starts_with("retrying") {
                    return event;
                }
            }
            panic!("stream ended before the retry was announced");
        })
        .await
        .expect("retry was not announced");
        assert_eq!(retrying.attempt, 2);

        f.orchestrator.cancel(task.id).await.unwrap();
        let rest = tokio::time::timeout(Duration::from_secs(5), stream.collect::<Vec<_>>())
            .await
            .expect("cancellation did not interrupt the backoff");
        assert_eq!(rest.last().unwrap().stage, TaskStage::Cancelled);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.orchestrator.running(), 0);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
        let status = f.orchestrator.status(task.id).await.unwrap();
        assert_eq!(status.stage, TaskStage::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_refused_while_finalizing() {
        let f = fixture(Scripted::default());
        let task = Task::new(TaskKind::Generate, vec![], TaskOptions::default());
        f.metadata.create_task(&task).await.unwrap();
        f.metadata
            .transition_task(
                task.id,
                &[TaskStage::Initializing],
                TaskStage::Finalizing,
                TaskUpdate::progress(90, "finalizing"),
                OffsetDateTime::now_utc(),
            )
            .await
            .unwrap();

        let err = f.orchestrator.cancel(task.id).await.unwrap_err();
        assert!(matches!(err, TaskError::TooLateToCancel(_)));

        let err = f.orchestrator.cancel(TaskId::new()).await.unwrap_err();
        assert!(matches!(err, TaskError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_start_rejects_bad_inputs() {
        let f = fixture(Scripted::default());
        let a = upload(&f, "a.txt", "alpha").await;
        let b = upload(&f, "b.txt", "beta").await;

        let cases = [
            (TaskKind::Generate, vec![], TaskOptions::default()),
            (TaskKind::Refine, vec![a, b], TaskOptions::default()),
            (
                TaskKind::Refine,
                vec![a],
                TaskOptions {
                    passes: Some(0),
                    ..TaskOptions::default()
                },
            ),
            (
                TaskKind::Generate,
                vec![InputRef::Upload(quire_core::UploadId::new())],
                TaskOptions::default(),
            ),
        ];
        for (kind, refs, options) in cases {
            let err = f.orchestrator.start(kind, refs, options).await.unwrap_err();
            assert!(matches!(err, TaskError::InvalidInput(_)), "{err}");
        }
        assert_eq!(f.orchestrator.running(), 0);
    }

    #[tokio::test]
    async fn test_refine_chains_passes() {
        let f = fixture_with(Arc::new(DryRunGenerator::new()), config(3));
        let input = upload(&f, "notes.txt", "Launch plan").await;

        let draft = f
            .orchestrator
            .start(TaskKind::Generate, vec![input], TaskOptions::default())
            .await
            .unwrap();
        run_to_end(&f, draft.id).await;

        let options = TaskOptions {
            passes: Some(3),
            ..TaskOptions::default()
        };
        let refine = f
            .orchestrator
            .start(TaskKind::Refine, vec![InputRef::Task(draft.id)], options)
            .await
            .unwrap();
        let events = run_to_end(&f, refine.id).await;
        assert_eq!(events.last().unwrap().stage, TaskStage::Completed);

        let output = f.orchestrator.output(refine.id).await.unwrap();
        assert!(output.content.starts_with("## notes.txt"));
        for pass in 1..=3 {
            assert!(output.content.contains(&format!("refinement pass {pass} of 3")));
        }
    }

    #[tokio::test]
    async fn test_output_before_completion() {
        let f = fixture(Scripted::slow(Duration::from_millis(200)));
        let input = upload(&f, "a.txt", "alpha").await;

        let task = f
            .orchestrator
            .start(TaskKind::Generate, vec![input], TaskOptions::default())
            .await
            .unwrap();
        let err = f.orchestrator.output(task.id).await.unwrap_err();
        assert!(matches!(err, TaskError::NotCompleted { .. }));

        let snapshot = f.orchestrator.progress(task.id).unwrap();
        assert!(!snapshot.stage.is_terminal());
        f.orchestrator.shutdown();
    }

    #[tokio::test]
    async fn test_reap_removes_finished_tasks() {
        let f = fixture(Scripted::default());
        let input = upload(&f, "a.txt", "alpha").await;

        let task = f
            .orchestrator
            .start(TaskKind::Generate, vec![input], TaskOptions::default())
            .await
            .unwrap();
        run_to_end(&f, task.id).await;
        let key = TaskOutput::object_key(task.id);
        assert!(f.storage.exists(&key).await.unwrap());

        let now = OffsetDateTime::now_utc();
        assert_eq!(f.orchestrator.reap(now).await.unwrap(), 0);

        let later = now + f.orchestrator.config().retention() + time::Duration::seconds(1);
        assert_eq!(f.orchestrator.reap(later).await.unwrap(), 1);
        assert!(matches!(
            f.orchestrator.status(task.id).await,
            Err(TaskError::NotFound(_))
        ));
        assert!(f.orchestrator.progress(task.id).is_err());
        assert!(!f.storage.exists(&key).await.unwrap());
    }
}
