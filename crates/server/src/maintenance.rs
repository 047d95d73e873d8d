//! Background maintenance: idle upload expiry plus upload and task reaping.

use crate::metrics::{TASKS_REAPED, UPLOAD_SESSIONS_EXPIRED, UPLOAD_SESSIONS_REAPED};
use crate::state::AppState;
use time::OffsetDateTime;
use tokio::task::JoinHandle;

/// Run one idle-upload sweep. Returns the number of sessions expired.
pub async fn sweep_uploads(state: &AppState) -> usize {
    match state.uploads.expire_idle(OffsetDateTime::now_utc()).await {
        Ok(expired) => {
            if expired > 0 {
                UPLOAD_SESSIONS_EXPIRED.inc_by(expired as u64);
                tracing::info!(expired, "expired idle upload sessions");
            }
            expired
        }
        Err(e) => {
            tracing::error!(error = %e, "upload sweep failed");
            0
        }
    }
}

/// Run one reap pass over finished upload sessions. Returns the number
/// removed.
pub async fn reap_uploads(state: &AppState) -> usize {
    match state.uploads.reap(OffsetDateTime::now_utc()).await {
        Ok(reaped) => {
            if reaped > 0 {
                UPLOAD_SESSIONS_REAPED.inc_by(reaped as u64);
                tracing::info!(reaped, "reaped finished upload sessions");
            }
            reaped
        }
        Err(e) => {
            tracing::error!(error = %e, "upload reap failed");
            0
        }
    }
}

/// Run one reap pass over terminal tasks. Returns the number removed.
pub async fn reap_tasks(state: &AppState) -> usize {
    match state.tasks.reap(OffsetDateTime::now_utc()).await {
        Ok(reaped) => {
            if reaped > 0 {
                TASKS_REAPED.inc_by(reaped as u64);
                tracing::info!(reaped, "reaped finished tasks");
            }
            reaped
        }
        Err(e) => {
            tracing::error!(error = %e, "task reap failed");
            0
        }
    }
}

/// Spawn the periodic sweep and reap loops.
pub fn spawn(state: AppState) -> Vec<JoinHandle<()>> {
    let sweep_state = state.clone();
    let sweep_interval = state.config.uploads.sweep_interval();
    let sweeper = tokio::spawn(async move {
        tracing::info!(
            interval_secs = sweep_interval.as_secs(),
            "upload sweeper started"
        );
        loop {
            tokio::time::sleep(sweep_interval).await;
            sweep_uploads(&sweep_state).await;
            reap_uploads(&sweep_state).await;
        }
    });

    let reap_interval = state.config.tasks.reap_interval();
    let reaper = tokio::spawn(async move {
        tracing::info!(interval_secs = reap_interval.as_secs(), "task reaper started");
        loop {
            tokio::time::sleep(reap_interval).await;
            reap_tasks(&state).await;
        }
    });

    vec![sweeper, reaper]
}
