//! Metadata store trait and the in-process implementation.

use crate::error::{MetadataError, MetadataResult, Transition};
use crate::repos::{ChunkMark, SessionUpdate, TaskRepo, TaskUpdate, UploadRepo};
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use quire_core::{Task, TaskId, TaskStage, UploadId, UploadSession, UploadState};
use time::OffsetDateTime;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore: UploadRepo + TaskRepo + Send + Sync {
    /// Check store health.
    async fn health_check(&self) -> MetadataResult<()>;

    /// Name of the implementation, for logging.
    fn backend_name(&self) -> &'static str;
}

/// In-process metadata store.
///
/// Every compare-and-set runs under the map entry's write lock, which makes
/// state checks and mutations on one record atomic with respect to each other.
#[derive(Default)]
pub struct MemoryStore {
    sessions: DashMap<UploadId, UploadSession>,
    tasks: DashMap<TaskId, Task>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn apply_task_update(task: &mut Task, update: TaskUpdate, at: OffsetDateTime) {
    if let Some(progress) = update.progress_percent {
        task.progress_percent = task.progress_percent.max(progress.min(100));
    }
    if let Some(message) = update.message {
        task.message = message;
    }
    if let Some(attempt) = update.attempt {
        task.attempt = attempt;
    }
    if let Some(reason) = update.failure_reason {
        task.failure_reason = Some(reason);
    }
    if let Some(output_ref) = update.output_ref {
        task.output_ref = Some(output_ref);
    }
    task.last_event_at = at;
}

#[async_trait]
impl UploadRepo for MemoryStore {
    async fn create_session(&self, session: &UploadSession) -> MetadataResult<()> {
        match self.sessions.entry(session.id) {
            Entry::Occupied(_) => Err(MetadataError::AlreadyExists(format!(
                "upload session {}",
                session.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(session.clone());
                Ok(())
            }
        }
    }

    async fn get_session(&self, upload_id: UploadId) -> MetadataResult<Option<UploadSession>> {
        Ok(self.sessions.get(&upload_id).map(|s| s.clone()))
    }

    async fn mark_chunk_received(
        &self,
        upload_id: UploadId,
        index: u32,
        at: OffsetDateTime,
    ) -> MetadataResult<ChunkMark> {
        let mut session = self
            .sessions
            .get_mut(&upload_id)
            .ok_or_else(|| MetadataError::NotFound(format!("upload session {upload_id}")))?;

        if !session.state.accepts_chunks() {
            return Ok(ChunkMark::Closed(session.clone()));
        }
        if !session.received_chunks.insert(index) {
            return Ok(ChunkMark::Duplicate(session.clone()));
        }
        session.state = UploadState::Receiving;
        session.last_activity_at = at;
        Ok(ChunkMark::Recorded(session.clone()))
    }

    async fn touch_session(&self, upload_id: UploadId, at: OffsetDateTime) -> MetadataResult<()> {
        let mut session = self
            .sessions
            .get_mut(&upload_id)
            .ok_or_else(|| MetadataError::NotFound(format!("upload session {upload_id}")))?;
        session.last_activity_at = session.last_activity_at.max(at);
        Ok(())
    }

    async fn transition_session(
        &self,
        upload_id: UploadId,
        from: &[UploadState],
        to: UploadState,
        update: SessionUpdate,
        at: OffsetDateTime,
    ) -> MetadataResult<Transition<UploadSession>> {
        let mut session = self
            .sessions
            .get_mut(&upload_id)
            .ok_or_else(|| MetadataError::NotFound(format!("upload session {upload_id}")))?;

        let active_since_cutoff = update
            .idle_before
            .is_some_and(|cutoff| session.last_activity_at >= cutoff);
        if !from.contains(&session.state) || active_since_cutoff {
            tracing::trace!(%upload_id, current = %session.state, target = %to, "session transition rejected");
            return Ok(Transition::Rejected(session.clone()));
        }
        tracing::trace!(%upload_id, from = %session.state, to = %to, "session transition");
        session.state = to;
        session.last_activity_at = at;
        if let Some(reason) = update.failure_reason {
            session.failure_reason = Some(reason);
        }
        if let Some(artifact) = update.artifact {
            session.artifact = Some(artifact);
        }
        Ok(Transition::Applied(session.clone()))
    }

    async fn list_idle_sessions(
        &self,
        idle_since: OffsetDateTime,
        limit: usize,
    ) -> MetadataResult<Vec<UploadSession>> {
        let mut idle: Vec<UploadSession> = self
            .sessions
            .iter()
            .filter(|s| !s.state.is_terminal() && s.last_activity_at < idle_since)
            .map(|s| s.clone())
            .collect();
        idle.sort_by_key(|s| s.last_activity_at);
        idle.truncate(limit);
        Ok(idle)
    }

    async fn list_finished_sessions(
        &self,
        finished_before: OffsetDateTime,
        limit: usize,
    ) -> MetadataResult<Vec<UploadSession>> {
        let mut finished: Vec<UploadSession> = self
            .sessions
            .iter()
            .filter(|s| s.state.is_terminal() && s.last_activity_at < finished_before)
            .map(|s| s.clone())
            .collect();
        finished.sort_by_key(|s| s.last_activity_at);
        finished.truncate(limit);
        Ok(finished)
    }

    async fn delete_session(&self, upload_id: UploadId) -> MetadataResult<()> {
        self.sessions.remove(&upload_id);
        Ok(())
    }

    async fn count_active_sessions(&self) -> MetadataResult<u64> {
        Ok(self
            .sessions
            .iter()
            .filter(|s| !s.state.is_terminal())
            .count() as u64)
    }
}

#[async_trait]
impl TaskRepo for MemoryStore {
    async fn create_task(&self, task: &Task) -> MetadataResult<()> {
        match self.tasks.entry(task.id) {
            Entry::Occupied(_) => Err(MetadataError::AlreadyExists(format!("task {}", task.id))),
            Entry::Vacant(slot) => {
                slot.insert(task.clone());
                Ok(())
            }
        }
    }

    async fn get_task(&self, task_id: TaskId) -> MetadataResult<Option<Task>> {
        Ok(self.tasks.get(&task_id).map(|t| t.clone()))
    }

    async fn transition_task(
        &self,
        task_id: TaskId,
        from: &[TaskStage],
        to: TaskStage,
        update: TaskUpdate,
        at: OffsetDateTime,
    ) -> MetadataResult<Transition<Task>> {
        let mut task = self
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| MetadataError::NotFound(format!("task {task_id}")))?;

        if !from.contains(&task.stage) {
            tracing::trace!(%task_id, current = %task.stage, target = %to, "task transition rejected");
            return Ok(Transition::Rejected(task.clone()));
        }
        tracing::trace!(%task_id, from = %task.stage, to = %to, "task transition");
        task.stage = to;
        apply_task_update(&mut *task, update, at);
        if to == TaskStage::Completed {
            task.progress_percent = 100;
        }
        if to.is_terminal() {
            task.finished_at = Some(at);
        }
        Ok(Transition::Applied(task.clone()))
    }

    async fn update_task(
        &self,
        task_id: TaskId,
        update: TaskUpdate,
        at: OffsetDateTime,
    ) -> MetadataResult<Transition<Task>> {
        let mut task = self
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| MetadataError::NotFound(format!("task {task_id}")))?;

        if task.stage.is_terminal() {
            return Ok(Transition::Rejected(task.clone()));
        }
        apply_task_update(&mut *task, update, at);
        Ok(Transition::Applied(task.clone()))
    }

    async fn list_finished_tasks(
        &self,
        finished_before: OffsetDateTime,
        limit: usize,
    ) -> MetadataResult<Vec<Task>> {
        let mut finished: Vec<Task> = self
            .tasks
            .iter()
            .filter(|t| t.stage.is_terminal() && t.finished_at.is_some_and(|f| f < finished_before))
            .map(|t| t.clone())
            .collect();
        finished.sort_by_key(|t| t.finished_at);
        finished.truncate(limit);
        Ok(finished)
    }

    async fn delete_task(&self, task_id: TaskId) -> MetadataResult<()> {
        self.tasks.remove(&task_id);
        Ok(())
    }

    async fn count_active_tasks(&self) -> MetadataResult<u64> {
        Ok(self
            .tasks
            .iter()
            .filter(|t| !t.stage.is_terminal())
            .count() as u64)
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn health_check(&self) -> MetadataResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quire_core::{TaskKind, TaskOptions};
    use std::sync::Arc;
    use time::Duration;

    fn session(total_chunks: u32) -> UploadSession {
        UploadSession::new("doc.txt", 100, "text/plain", total_chunks)
    }

    #[tokio::test]
    async fn test_create_session_rejects_duplicate_id() {
        let store = MemoryStore::new();
        let s = session(2);
        store.create_session(&s).await.unwrap();
        assert!(matches!(
            store.create_session(&s).await,
            Err(MetadataError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_mark_chunk_moves_to_receiving_and_rejects_duplicates() {
        let store = MemoryStore::new();
        let s = session(3);
        store.create_session(&s).await.unwrap();
        let now = OffsetDateTime::now_utc();

        match store.mark_chunk_received(s.id, 1, now).await.unwrap() {
            ChunkMark::Recorded(updated) => {
                assert_eq!(updated.state, UploadState::Receiving);
                assert_eq!(updated.received_count(), 1);
            }
            other => panic!("expected Recorded, got {other:?}"),
        }
        assert!(matches!(
            store.mark_chunk_received(s.id, 1, now).await.unwrap(),
            ChunkMark::Duplicate(_)
        ));
    }

    #[tokio::test]
    async fn test_mark_chunk_on_missing_session() {
        let store = MemoryStore::new();
        let result = store
            .mark_chunk_received(UploadId::new(), 0, OffsetDateTime::now_utc())
            .await;
        assert!(matches!(result, Err(MetadataError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_concurrent_marks_never_double_count() {
        let store = Arc::new(MemoryStore::new());
        let s = session(64);
        store.create_session(&s).await.unwrap();
        let id = s.id;

        let mut handles = Vec::new();
        for index in 0..64u32 {
            for _ in 0..2 {
                let store = store.clone();
                handles.push(tokio::spawn(async move {
                    store
                        .mark_chunk_received(id, index, OffsetDateTime::now_utc())
                        .await
                        .unwrap()
                }));
            }
        }
        let mut recorded = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), ChunkMark::Recorded(_)) {
                recorded += 1;
            }
        }
        assert_eq!(recorded, 64);
        let stored = store.get_session(s.id).await.unwrap().unwrap();
        assert!(stored.is_fully_received());
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_set() {
        let store = MemoryStore::new();
        let s = session(1);
        store.create_session(&s).await.unwrap();
        let now = OffsetDateTime::now_utc();

        let first = store
            .transition_session(
                s.id,
                &[UploadState::Initialized, UploadState::Receiving],
                UploadState::Assembling,
                SessionUpdate::default(),
                now,
            )
            .await
            .unwrap();
        assert!(first.is_applied());

        let second = store
            .transition_session(
                s.id,
                &[UploadState::Initialized, UploadState::Receiving],
                UploadState::Assembling,
                SessionUpdate::default(),
                now,
            )
            .await
            .unwrap();
        assert!(!second.is_applied());
        assert_eq!(second.into_inner().state, UploadState::Assembling);

        // Closed sessions refuse further chunk marks
        assert!(matches!(
            store.mark_chunk_received(s.id, 0, now).await.unwrap(),
            ChunkMark::Closed(_)
        ));
    }

    #[tokio::test]
    async fn test_list_idle_sessions_skips_terminal() {
        let store = MemoryStore::new();
        let idle = session(1);
        let done = session(1);
        store.create_session(&idle).await.unwrap();
        store.create_session(&done).await.unwrap();
        store
            .transition_session(
                done.id,
                &[UploadState::Initialized],
                UploadState::Failed,
                SessionUpdate::failed("bad"),
                idle.created_at,
            )
            .await
            .unwrap();

        let later = OffsetDateTime::now_utc() + Duration::hours(2);
        let found = store.list_idle_sessions(later, 10).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, idle.id);
        assert_eq!(store.count_active_sessions().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_idle_guard_rejects_recently_touched_session() {
        let store = MemoryStore::new();
        let s = session(2);
        store.create_session(&s).await.unwrap();

        let cutoff = s.created_at + Duration::seconds(10);
        // Activity after the cutoff, e.g. a chunk arriving mid-sweep.
        store
            .touch_session(s.id, cutoff + Duration::seconds(1))
            .await
            .unwrap();

        let open = [UploadState::Initialized, UploadState::Receiving];
        let outcome = store
            .transition_session(
                s.id,
                &open,
                UploadState::Expired,
                SessionUpdate::failed("idle").if_idle_before(cutoff),
                cutoff,
            )
            .await
            .unwrap();
        assert!(!outcome.is_applied());
        assert_eq!(outcome.into_inner().state, UploadState::Initialized);

        let later = cutoff + Duration::seconds(5);
        let outcome = store
            .transition_session(
                s.id,
                &open,
                UploadState::Expired,
                SessionUpdate::failed("idle").if_idle_before(later),
                later,
            )
            .await
            .unwrap();
        assert!(outcome.is_applied());
    }

    #[tokio::test]
    async fn test_list_finished_sessions_by_cutoff() {
        let store = MemoryStore::new();
        let open = session(1);
        let failed = session(1);
        store.create_session(&open).await.unwrap();
        store.create_session(&failed).await.unwrap();
        let finished_at = failed.created_at + Duration::minutes(1);
        store
            .transition_session(
                failed.id,
                &[UploadState::Initialized],
                UploadState::Failed,
                SessionUpdate::failed("bad"),
                finished_at,
            )
            .await
            .unwrap();

        assert!(store
            .list_finished_sessions(finished_at, 10)
            .await
            .unwrap()
            .is_empty());
        let found = store
            .list_finished_sessions(finished_at + Duration::seconds(1), 10)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, failed.id);

        store.delete_session(failed.id).await.unwrap();
        assert!(store.get_session(failed.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_task_progress_never_decreases() {
        let store = MemoryStore::new();
        let task = Task::new(TaskKind::Generate, vec![], TaskOptions::default());
        store.create_task(&task).await.unwrap();
        let now = OffsetDateTime::now_utc();

        store
            .update_task(task.id, TaskUpdate::progress(40, "halfway"), now)
            .await
            .unwrap();
        let updated = store
            .update_task(task.id, TaskUpdate::progress(20, "late event"), now)
            .await
            .unwrap()
            .into_inner();
        assert_eq!(updated.progress_percent, 40);
        assert_eq!(updated.message, "late event");
    }

    #[tokio::test]
    async fn test_terminal_tasks_are_immutable() {
        let store = MemoryStore::new();
        let task = Task::new(TaskKind::Refine, vec![], TaskOptions::default());
        store.create_task(&task).await.unwrap();
        let now = OffsetDateTime::now_utc();

        let cancelled = store
            .transition_task(
                task.id,
                &[TaskStage::Initializing, TaskStage::Processing],
                TaskStage::Cancelled,
                TaskUpdate::default().with_reason("cancelled by client"),
                now,
            )
            .await
            .unwrap();
        assert!(cancelled.is_applied());
        let cancelled = cancelled.into_inner();
        assert_eq!(cancelled.finished_at, Some(now));

        let reenter = store
            .transition_task(
                task.id,
                &[TaskStage::Initializing],
                TaskStage::Processing,
                TaskUpdate::default(),
                now,
            )
            .await
            .unwrap();
        assert!(!reenter.is_applied());

        let update = store
            .update_task(task.id, TaskUpdate::progress(50, "ignored"), now)
            .await
            .unwrap();
        assert!(!update.is_applied());
        assert_eq!(update.into_inner().message, cancelled.message);
    }

    #[tokio::test]
    async fn test_completion_sets_full_progress_and_output() {
        let store = MemoryStore::new();
        let task = Task::new(TaskKind::Generate, vec![], TaskOptions::default());
        store.create_task(&task).await.unwrap();

        let done = store
            .transition_task(
                task.id,
                &[TaskStage::Initializing],
                TaskStage::Completed,
                TaskUpdate::default().with_output("outputs/x.json"),
                OffsetDateTime::now_utc(),
            )
            .await
            .unwrap()
            .into_inner();
        assert_eq!(done.progress_percent, 100);
        assert_eq!(done.output_ref.as_deref(), Some("outputs/x.json"));
        assert_eq!(store.count_active_tasks().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_finished_tasks_by_cutoff() {
        let store = MemoryStore::new();
        let task = Task::new(TaskKind::Generate, vec![], TaskOptions::default());
        store.create_task(&task).await.unwrap();
        let finished_at = OffsetDateTime::now_utc();
        store
            .transition_task(
                task.id,
                &[TaskStage::Initializing],
                TaskStage::Failed,
                TaskUpdate::default().with_reason("boom"),
                finished_at,
            )
            .await
            .unwrap();

        assert!(
            store
                .list_finished_tasks(finished_at, 10)
                .await
                .unwrap()
                .is_empty()
        );
        let found = store
            .list_finished_tasks(finished_at + Duration::seconds(1), 10)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);

        store.delete_task(task.id).await.unwrap();
        assert!(store.get_task(task.id).await.unwrap().is_none());
    }
}
