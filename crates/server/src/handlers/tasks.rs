//! Task handlers.

use crate::error::{ApiError, ApiResult};
use crate::metrics::{TASKS_CANCELLED, TASKS_FINISHED, TASKS_STARTED};
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use futures::StreamExt;
use quire_core::task::{
    CancelTaskResponse, StartTaskRequest, StartTaskResponse, TaskStatusResponse,
};
use quire_core::{TaskId, TaskKind, TaskOutput};
use quire_engine::TaskOrchestrator;

/// Maximum request body size for task start requests (1 MiB).
const MAX_START_BODY_SIZE: usize = 1024 * 1024;

pub(crate) fn parse_task_id(raw: &str) -> ApiResult<TaskId> {
    TaskId::parse(raw).map_err(|e| ApiError::BadRequest(format!("invalid task ID: {e}")))
}

/// Count the task's outcome once it reaches a terminal stage.
fn track_outcome(tasks: TaskOrchestrator, task_id: TaskId) {
    tokio::spawn(async move {
        let Ok(events) = tasks.events(task_id, 0).await else {
            return;
        };
        let mut events = std::pin::pin!(events);
        while let Some(event) = events.next().await {
            if event.is_terminal() {
                TASKS_FINISHED
                    .with_label_values(&[event.stage.as_str()])
                    .inc();
            }
        }
    });
}

async fn start_task(
    state: AppState,
    kind: TaskKind,
    req: Request,
) -> ApiResult<(StatusCode, Json<StartTaskResponse>)> {
    let body: StartTaskRequest = {
        let bytes = axum::body::to_bytes(req.into_body(), MAX_START_BODY_SIZE)
            .await
            .map_err(|e| ApiError::BadRequest(format!("failed to read body: {e}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ApiError::BadRequest(format!("invalid JSON: {e}")))?
    };

    let task = state
        .tasks
        .start(kind, body.input_refs, body.options)
        .await?;
    tracing::Span::current().record("task_id", tracing::field::display(task.id));
    TASKS_STARTED.with_label_values(&[kind.as_str()]).inc();
    track_outcome(state.tasks.clone(), task.id);

    Ok((
        StatusCode::ACCEPTED,
        Json(StartTaskResponse { task_id: task.id }),
    ))
}

/// POST /v1/tasks/generate
#[tracing::instrument(skip(state, req), fields(task_id))]
pub async fn start_generate(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<(StatusCode, Json<StartTaskResponse>)> {
    start_task(state, TaskKind::Generate, req).await
}

/// POST /v1/tasks/refine
#[tracing::instrument(skip(state, req), fields(task_id))]
pub async fn start_refine(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<(StatusCode, Json<StartTaskResponse>)> {
    start_task(state, TaskKind::Refine, req).await
}

/// POST /v1/tasks/{task_id}/cancel
#[tracing::instrument(skip(state), fields(task_id = %task_id))]
pub async fn cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<CancelTaskResponse>> {
    let task_id = parse_task_id(&task_id)?;
    let task = state.tasks.cancel(task_id).await?;
    TASKS_CANCELLED.inc();
    Ok(Json(CancelTaskResponse {
        accepted: true,
        stage: task.stage,
    }))
}

/// GET /v1/tasks/{task_id}
#[tracing::instrument(skip(state), fields(task_id = %task_id))]
pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<TaskStatusResponse>> {
    let task_id = parse_task_id(&task_id)?;
    let task = state.tasks.status(task_id).await?;
    let response = TaskStatusResponse::from(&task);
    // The event log is dropped when the task is reaped.
    Ok(Json(match state.tasks.progress(task_id) {
        Ok(snapshot) => response.with_progress(&snapshot),
        Err(_) => response,
    }))
}

/// GET /v1/tasks/{task_id}/output
#[tracing::instrument(skip(state), fields(task_id = %task_id))]
pub async fn get_task_output(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<TaskOutput>> {
    let task_id = parse_task_id(&task_id)?;
    let output = state.tasks.output(task_id).await?;
    Ok(Json(output))
}
