//! In-process fan-out of task progress.
//!
//! Each task owns an append-only log. Publishing assigns the next sequence
//! number and bumps a watch counter; every subscriber keeps its own cursor
//! into the log, so slow readers never block the publisher or each other.
//! Logs are kept until the task is reaped.

use async_stream::stream;
use dashmap::DashMap;
use futures::Stream;
use quire_core::{ProgressEvent, ProgressSnapshot, ProgressUpdate, TaskId, TaskStage};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::watch;

/// Progress bus errors.
#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("no progress log for task {0}")]
    UnknownTask(TaskId),

    #[error("progress log for task {0} already ended")]
    Closed(TaskId),
}

struct TaskLog {
    events: RwLock<Vec<ProgressEvent>>,
    /// Count of events appended so far.
    published: watch::Sender<usize>,
}

impl TaskLog {
    fn new() -> Self {
        let (published, _) = watch::channel(0);
        Self {
            events: RwLock::new(Vec::new()),
            published,
        }
    }

    fn read_from(&self, offset: usize) -> Vec<ProgressEvent> {
        let events = self.events.read().unwrap_or_else(PoisonError::into_inner);
        events.get(offset..).map(<[_]>::to_vec).unwrap_or_default()
    }

    fn last(&self) -> Option<ProgressEvent> {
        let events = self.events.read().unwrap_or_else(PoisonError::into_inner);
        events.last().cloned()
    }

    fn is_closed(&self) -> bool {
        self.last().is_some_and(|event| event.is_terminal())
    }
}

/// Per-task progress logs keyed by task id.
#[derive(Default)]
pub struct ProgressBus {
    logs: DashMap<TaskId, Arc<TaskLog>>,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the log for a task. Calling it again is a no-op.
    pub fn open(&self, task_id: TaskId) {
        self.logs
            .entry(task_id)
            .or_insert_with(|| Arc::new(TaskLog::new()));
    }

    fn log(&self, task_id: TaskId) -> Result<Arc<TaskLog>, ProgressError> {
        self.logs
            .get(&task_id)
            .map(|log| Arc::clone(&log))
            .ok_or(ProgressError::UnknownTask(task_id))
    }

    /// Append an event and wake subscribers.
    ///
    /// Progress never goes backwards: a lower value is raised to the last
    /// published one, and a Completed event always reports 100. Nothing can
    /// be appended after a terminal event.
    pub fn publish(
        &self,
        task_id: TaskId,
        update: ProgressUpdate,
    ) -> Result<ProgressEvent, ProgressError> {
        let log = self.log(task_id)?;
        let event = {
            let mut events = log.events.write().unwrap_or_else(PoisonError::into_inner);
            let (sequence, floor) = match events.last() {
                Some(last) if last.is_terminal() => return Err(ProgressError::Closed(task_id)),
                Some(last) => (last.sequence + 1, last.progress_percent),
                None => (0, 0),
            };
            let progress_percent = if update.stage == TaskStage::Completed {
                100
            } else {
                update.progress_percent.min(100).max(floor)
            };
            let event = ProgressEvent {
                task_id,
                sequence,
                stage: update.stage,
                progress_percent,
                message: update.message,
                attempt: update.attempt,
                reason: update.reason,
                timestamp: OffsetDateTime::now_utc(),
            };
            events.push(event.clone());
            event
        };
        log.published.send_replace(event.sequence as usize + 1);
        Ok(event)
    }

    /// Stream events with `sequence >= from_sequence`: the buffered ones
    /// first, then live ones as they are published.
    ///
    /// The stream ends after yielding the terminal event, or immediately if
    /// the terminal event is older than `from_sequence`.
    pub fn subscribe(
        &self,
        task_id: TaskId,
        from_sequence: u64,
    ) -> Result<impl Stream<Item = ProgressEvent> + Send + use<>, ProgressError> {
        let log = self.log(task_id)?;
        let mut published = log.published.subscribe();
        let mut cursor = usize::try_from(from_sequence).unwrap_or(usize::MAX);

        Ok(stream! {
            loop {
                for event in log.read_from(cursor) {
                    cursor = event.sequence as usize + 1;
                    let terminal = event.is_terminal();
                    yield event;
                    if terminal {
                        return;
                    }
                }
                if log.is_closed() || published.changed().await.is_err() {
                    return;
                }
            }
        })
    }

    /// Latest snapshot of a task's progress, if anything was published.
    pub fn poll(&self, task_id: TaskId) -> Option<ProgressSnapshot> {
        self.logs
            .get(&task_id)
            .and_then(|log| log.last())
            .map(|event| ProgressSnapshot::from(&event))
    }

    /// Every event published for a task so far.
    pub fn history(&self, task_id: TaskId) -> Vec<ProgressEvent> {
        self.logs
            .get(&task_id)
            .map(|log| log.read_from(0))
            .unwrap_or_default()
    }

    /// Drop a task's log. Existing subscribers keep their copy.
    pub fn remove(&self, task_id: TaskId) -> bool {
        self.logs.remove(&task_id).is_some()
    }

    /// Number of open logs.
    pub fn len(&self) -> usize {
        self.logs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    fn update(stage: TaskStage, percent: u8) -> ProgressUpdate {
        ProgressUpdate::new(stage, percent, format!("{stage} {percent}"))
    }

    #[test]
    fn test_sequences_start_at_zero() {
        let bus = ProgressBus::new();
        let task_id = TaskId::new();
        bus.open(task_id);

        let first = bus.publish(task_id, update(TaskStage::Initializing, 0)).unwrap();
        let second = bus.publish(task_id, update(TaskStage::Processing, 10)).unwrap();
        assert_eq!(first.sequence, 0);
        assert_eq!(second.sequence, 1);
    }

    #[test]
    fn test_publish_requires_open_log() {
        let bus = ProgressBus::new();
        let err = bus
            .publish(TaskId::new(), update(TaskStage::Initializing, 0))
            .unwrap_err();
        assert!(matches!(err, ProgressError::UnknownTask(_)));
    }

    #[test]
    fn test_progress_never_decreases() {
        let bus = ProgressBus::new();
        let task_id = TaskId::new();
        bus.open(task_id);

        bus.publish(task_id, update(TaskStage::Processing, 40)).unwrap();
        let lowered = bus.publish(task_id, update(TaskStage::Processing, 20)).unwrap();
        assert_eq!(lowered.progress_percent, 40);

        let completed = bus.publish(task_id, update(TaskStage::Completed, 0)).unwrap();
        assert_eq!(completed.progress_percent, 100);
    }

    #[test]
    fn test_nothing_after_terminal() {
        let bus = ProgressBus::new();
        let task_id = TaskId::new();
        bus.open(task_id);

        bus.publish(task_id, update(TaskStage::Cancelled, 30)).unwrap();
        let err = bus
            .publish(task_id, update(TaskStage::Processing, 50))
            .unwrap_err();
        assert!(matches!(err, ProgressError::Closed(_)));
        assert_eq!(bus.history(task_id).len(), 1);
    }

    #[test]
    fn test_poll_returns_latest() {
        let bus = ProgressBus::new();
        let task_id = TaskId::new();
        bus.open(task_id);
        assert!(bus.poll(task_id).is_none());

        bus.publish(task_id, update(TaskStage::Initializing, 0)).unwrap();
        bus.publish(task_id, update(TaskStage::Processing, 55)).unwrap();

        let snapshot = bus.poll(task_id).unwrap();
        assert_eq!(snapshot.stage, TaskStage::Processing);
        assert_eq!(snapshot.progress_percent, 55);
        assert_eq!(snapshot.sequence, 1);
    }

    #[tokio::test]
    async fn test_subscriber_sees_history_then_live_and_ends() {
        let bus = Arc::new(ProgressBus::new());
        let task_id = TaskId::new();
        bus.open(task_id);
        bus.publish(task_id, update(TaskStage::Initializing, 0)).unwrap();

        let stream = bus.subscribe(task_id, 0).unwrap();
        let publisher = {
            let bus = bus.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                bus.publish(task_id, update(TaskStage::Processing, 50)).unwrap();
                tokio::time::sleep(Duration::from_millis(10)).await;
                bus.publish(task_id, update(TaskStage::Completed, 100)).unwrap();
            })
        };

        let events: Vec<_> = tokio::time::timeout(Duration::from_secs(5), stream.collect())
            .await
            .unwrap();
        publisher.await.unwrap();

        let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
        assert!(events.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn test_resume_from_sequence() {
        let bus = ProgressBus::new();
        let task_id = TaskId::new();
        bus.open(task_id);
        for percent in [0, 20, 40, 60] {
            bus.publish(task_id, update(TaskStage::Processing, percent)).unwrap();
        }
        bus.publish(task_id, update(TaskStage::Failed, 60)).unwrap();

        let events: Vec<_> = bus.subscribe(task_id, 3).unwrap().collect().await;
        let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![3, 4]);
    }

    #[tokio::test]
    async fn test_subscribe_past_terminal_ends_immediately() {
        let bus = ProgressBus::new();
        let task_id = TaskId::new();
        bus.open(task_id);
        bus.publish(task_id, update(TaskStage::Completed, 100)).unwrap();

        let events: Vec<_> = tokio::time::timeout(
            Duration::from_secs(1),
            bus.subscribe(task_id, 10).unwrap().collect::<Vec<_>>(),
        )
        .await
        .unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_independent_subscribers_see_full_sequence() {
        let bus = Arc::new(ProgressBus::new());
        let task_id = TaskId::new();
        bus.open(task_id);

        let fast = bus.subscribe(task_id, 0).unwrap();
        let slow = bus.subscribe(task_id, 0).unwrap();

        for percent in [0, 25, 50, 75] {
            bus.publish(task_id, update(TaskStage::Processing, percent)).unwrap();
        }
        bus.publish(task_id, update(TaskStage::Completed, 100)).unwrap();

        let fast: Vec<_> = fast.collect().await;
        let slow: Vec<_> = slow
            .then(|event| async move {
                tokio::time::sleep(Duration::from_millis(2)).await;
                event
            })
            .collect()
            .await;

        assert_eq!(fast.len(), 5);
        assert_eq!(fast, slow);
    }

    #[test]
    fn test_remove_drops_log() {
        let bus = ProgressBus::new();
        let task_id = TaskId::new();
        bus.open(task_id);
        assert_eq!(bus.len(), 1);
        assert!(bus.remove(task_id));
        assert!(!bus.remove(task_id));
        assert!(bus.is_empty());
        assert!(bus.subscribe(task_id, 0).is_err());
    }
}
