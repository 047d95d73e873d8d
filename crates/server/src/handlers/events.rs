//! Server-sent progress events.
//!
//! Each event carries `id = sequence` so a reconnecting client can resume
//! with `Last-Event-ID`, or explicitly with `?from_sequence=N`. The stream
//! closes after the terminal event.

use crate::error::{ApiError, ApiResult};
use crate::handlers::tasks::parse_task_id;
use crate::metrics::ACTIVE_EVENT_STREAMS;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use quire_core::ProgressEvent;
use serde::Deserialize;
use std::convert::Infallible;

/// Query parameters for the event stream.
#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    /// First sequence to deliver. Takes precedence over `Last-Event-ID`.
    pub from_sequence: Option<u64>,
}

/// Keeps the open-stream gauge accurate however the stream ends.
struct StreamGuard;

impl StreamGuard {
    fn new() -> Self {
        ACTIVE_EVENT_STREAMS.inc();
        Self
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        ACTIVE_EVENT_STREAMS.dec();
    }
}

/// Resolve where to start: explicit query first, then one past the last
/// event the client saw.
fn start_sequence(query: &EventsQuery, headers: &HeaderMap) -> ApiResult<u64> {
    if let Some(from) = query.from_sequence {
        return Ok(from);
    }
    match headers.get("last-event-id") {
        None => Ok(0),
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(|last| last.saturating_add(1))
            .ok_or_else(|| ApiError::BadRequest("invalid Last-Event-ID header".to_string())),
    }
}

fn to_sse(event: &ProgressEvent) -> Event {
    let sse = Event::default()
        .id(event.sequence.to_string())
        .event("progress");
    match serde_json::to_string(event) {
        Ok(json) => sse.data(json),
        Err(e) => sse.comment(format!("failed to encode event: {e}")),
    }
}

/// GET /v1/tasks/{task_id}/events
#[tracing::instrument(skip(state, headers, query), fields(task_id = %task_id))]
pub async fn task_events(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let task_id = parse_task_id(&task_id)?;
    let from_sequence = start_sequence(&query, &headers)?;
    let events = state.tasks.events(task_id, from_sequence).await?;
    tracing::debug!(from_sequence, "event stream opened");

    let stream = async_stream::stream! {
        let _guard = StreamGuard::new();
        for await event in events {
            yield Ok::<_, Infallible>(to_sse(&event));
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(state.config.server.event_keepalive())
            .text(""),
    ))
}
