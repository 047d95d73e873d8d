//! Task repository.

use crate::error::{MetadataResult, Transition};
use async_trait::async_trait;
use quire_core::{Task, TaskId, TaskStage};
use time::OffsetDateTime;

/// Fields written alongside a task update. `None` leaves a field unchanged.
#[derive(Clone, Debug, Default)]
pub struct TaskUpdate {
    /// Ignored if lower than the current value.
    pub progress_percent: Option<u8>,
    pub message: Option<String>,
    pub attempt: Option<u32>,
    pub failure_reason: Option<String>,
    pub output_ref: Option<String>,
}

impl TaskUpdate {
    pub fn progress(progress_percent: u8, message: impl Into<String>) -> Self {
        Self {
            progress_percent: Some(progress_percent),
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.failure_reason = Some(reason.into());
        self
    }

    pub fn with_output(mut self, output_ref: impl Into<String>) -> Self {
        self.output_ref = Some(output_ref.into());
        self
    }
}

/// Repository for task state.
#[async_trait]
pub trait TaskRepo: Send + Sync {
    /// Create a new task.
    async fn create_task(&self, task: &Task) -> MetadataResult<()>;

    /// Get a task by ID.
    async fn get_task(&self, task_id: TaskId) -> MetadataResult<Option<Task>>;

    /// Move the task to `to` if its current stage is one of `from`, applying
    /// `update` in the same step.
    ///
    /// Entering a terminal stage stamps `finished_at`. Returns `NotFound` if
    /// the task does not exist.
    async fn transition_task(
        &self,
        task_id: TaskId,
        from: &[TaskStage],
        to: TaskStage,
        update: TaskUpdate,
        at: OffsetDateTime,
    ) -> MetadataResult<Transition<Task>>;

    /// Apply `update` without changing stage. Rejected once the task is terminal.
    async fn update_task(
        &self,
        task_id: TaskId,
        update: TaskUpdate,
        at: OffsetDateTime,
    ) -> MetadataResult<Transition<Task>>;

    /// Terminal tasks that finished before `finished_before`.
    async fn list_finished_tasks(
        &self,
        finished_before: OffsetDateTime,
        limit: usize,
    ) -> MetadataResult<Vec<Task>>;

    /// Delete a task record.
    async fn delete_task(&self, task_id: TaskId) -> MetadataResult<()>;

    /// Count tasks that have not reached a terminal stage.
    async fn count_active_tasks(&self) -> MetadataResult<u64>;
}
