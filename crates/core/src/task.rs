//! Generation task types, progress events, and stage bands.

use crate::upload::UploadId;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

/// Unique identifier for a task.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generate a new random task ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from a string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::Error::InvalidId(format!("invalid task ID: {e}")))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for TaskId {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({})", self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a task produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Draft a new document from uploaded inputs.
    Generate,
    /// Rework an existing document over one or more passes.
    Refine,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generate => "generate",
            Self::Refine => "refine",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task lifecycle stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStage {
    Initializing,
    Processing,
    Finalizing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Cancellation is refused once finalization has begun.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, Self::Initializing | Self::Processing)
    }

    /// Visible progress band `(low, high)` for the stage.
    ///
    /// Terminal stages collapse to a point: Completed is always 100, while
    /// Failed and Cancelled keep whatever progress was last reported.
    pub fn band(&self) -> (u8, u8) {
        match self {
            Self::Initializing => (0, 10),
            Self::Processing => (10, 90),
            Self::Finalizing => (90, 100),
            Self::Completed => (100, 100),
            Self::Failed | Self::Cancelled => (0, 100),
        }
    }

    /// Map a fraction of the stage's internal work onto visible progress.
    pub fn scale(&self, done: u32, total: u32) -> u8 {
        let (low, high) = self.band();
        if total == 0 || done >= total {
            return high;
        }
        let span = u32::from(high - low);
        low + (span * done / total) as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Processing => "processing",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reference to task input: a completed upload or a completed task's output.
///
/// Textual form is `upload:<uuid>` or `task:<uuid>`; a bare UUID is read as
/// an upload reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InputRef {
    Upload(UploadId),
    Task(TaskId),
}

impl fmt::Display for InputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upload(id) => write!(f, "upload:{id}"),
            Self::Task(id) => write!(f, "task:{id}"),
        }
    }
}

impl FromStr for InputRef {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        let invalid = |e: crate::Error| crate::Error::InvalidInputRef(format!("{s}: {e}"));
        match s.split_once(':') {
            Some(("upload", id)) => UploadId::parse(id).map(Self::Upload).map_err(invalid),
            Some(("task", id)) => TaskId::parse(id).map(Self::Task).map_err(invalid),
            Some((prefix, _)) => Err(crate::Error::InvalidInputRef(format!(
                "unknown reference kind '{prefix}' in {s}"
            ))),
            None => UploadId::parse(s).map(Self::Upload).map_err(invalid),
        }
    }
}

impl Serialize for InputRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for InputRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Caller-supplied task options, forwarded to the generation operation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskOptions {
    /// Free-form guidance for the generator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    /// Number of refinement passes (refine tasks only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passes: Option<u32>,
    /// Anything else is passed through untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One run of the generation/refinement workflow.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub input_refs: Vec<InputRef>,
    pub options: TaskOptions,
    pub stage: TaskStage,
    pub progress_percent: u8,
    /// Latest progress message.
    pub message: String,
    /// Attempt number of the current generation step (1-based, 0 before the first call).
    pub attempt: u32,
    /// Recorded reason for Failed/Cancelled tasks.
    pub failure_reason: Option<String>,
    /// Object store key of the stored output once Completed.
    pub output_ref: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_event_at: OffsetDateTime,
    /// When the task reached a terminal stage.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
}

impl Task {
    /// Create a task in the Initializing stage.
    pub fn new(kind: TaskKind, input_refs: Vec<InputRef>, options: TaskOptions) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: TaskId::new(),
            kind,
            input_refs,
            options,
            stage: TaskStage::Initializing,
            progress_percent: 0,
            message: "queued".to_string(),
            attempt: 0,
            failure_reason: None,
            output_ref: None,
            created_at: now,
            last_event_at: now,
            finished_at: None,
        }
    }

    /// Terminal tasks older than `retention` at `now` may be reaped.
    pub fn is_reapable(&self, now: OffsetDateTime, retention: time::Duration) -> bool {
        match self.finished_at {
            Some(finished) if self.stage.is_terminal() => now - finished > retention,
            _ => false,
        }
    }
}

/// Progress payload before the bus assigns it a sequence number.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub stage: TaskStage,
    pub progress_percent: u8,
    pub message: String,
    pub attempt: u32,
    pub reason: Option<String>,
}

impl ProgressUpdate {
    pub fn new(stage: TaskStage, progress_percent: u8, message: impl Into<String>) -> Self {
        Self {
            stage,
            progress_percent,
            message: message.into(),
            attempt: 0,
            reason: None,
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// An ordered, immutable record of a task's progress.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub task_id: TaskId,
    /// Monotonic per task, starting at 0.
    pub sequence: u64,
    pub stage: TaskStage,
    pub progress_percent: u8,
    pub message: String,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }
}

/// Latest known progress for a task.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub stage: TaskStage,
    pub progress_percent: u8,
    pub message: String,
    /// Sequence of the event the snapshot was taken from.
    pub sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl From<&ProgressEvent> for ProgressSnapshot {
    fn from(event: &ProgressEvent) -> Self {
        Self {
            stage: event.stage,
            progress_percent: event.progress_percent,
            message: event.message.clone(),
            sequence: event.sequence,
            reason: event.reason.clone(),
        }
    }
}

/// Request body for starting a generate or refine task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StartTaskRequest {
    pub input_refs: Vec<InputRef>,
    #[serde(default)]
    pub options: TaskOptions,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StartTaskResponse {
    pub task_id: TaskId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CancelTaskResponse {
    pub accepted: bool,
    pub stage: TaskStage,
}

/// Response from polling a task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskStatusResponse {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub stage: TaskStage,
    pub progress_percent: u8,
    pub message: String,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_ref: Option<String>,
}

impl From<&Task> for TaskStatusResponse {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id,
            kind: task.kind,
            stage: task.stage,
            progress_percent: task.progress_percent,
            message: task.message.clone(),
            attempt: task.attempt,
            reason: task.failure_reason.clone(),
            output_ref: task.output_ref.clone(),
        }
    }
}

impl TaskStatusResponse {
    /// Report stage, percent and message from the latest progress event.
    ///
    /// A terminal stage already recorded on the task is kept until the
    /// matching event is published.
    pub fn with_progress(mut self, snapshot: &ProgressSnapshot) -> Self {
        if self.stage.is_terminal() && !snapshot.stage.is_terminal() {
            return self;
        }
        self.stage = snapshot.stage;
        self.progress_percent = snapshot.progress_percent;
        self.message = snapshot.message.clone();
        if snapshot.reason.is_some() {
            self.reason = snapshot.reason.clone();
        }
        self
    }
}

/// One generated section of a task's output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSection {
    /// The input the section was produced from.
    pub source: String,
    pub content: String,
}

/// Document produced by a completed task.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub content: String,
    #[serde(default)]
    pub sections: Vec<OutputSection>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl TaskOutput {
    /// Object store key for a task's output.
    pub fn object_key(task_id: TaskId) -> String {
        format!("outputs/{task_id}.json")
    }
}
