//! Capability discovery endpoint.

use crate::error::ApiResult;
use crate::state::AppState;
use axum::Json;
use axum::extract::State;
use serde::Serialize;

/// Retry behaviour applied to generation steps.
#[derive(Debug, Serialize)]
pub struct RetryCapabilities {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
}

/// Capabilities response.
#[derive(Debug, Serialize)]
pub struct CapabilitiesResponse {
    /// Largest accepted chunk request body in bytes.
    pub max_chunk_body_size: u64,
    pub max_total_chunks: u32,
    pub max_declared_size: u64,
    /// Recommended number of concurrent chunk requests.
    pub max_parallel_chunks: u32,
    pub allowed_mime_types: Vec<String>,
    /// Whether interrupted uploads can be resumed from the missing chunk list.
    pub supports_resume: bool,
    pub retry: RetryCapabilities,
    pub max_refine_passes: u32,
    pub api_version: &'static str,
}

/// GET /v1/capabilities
pub async fn get_capabilities(
    State(state): State<AppState>,
) -> ApiResult<Json<CapabilitiesResponse>> {
    let uploads = &state.config.uploads;
    let tasks = &state.config.tasks;
    Ok(Json(CapabilitiesResponse {
        max_chunk_body_size: state.config.server.max_chunk_body_size,
        max_total_chunks: uploads.max_total_chunks,
        max_declared_size: uploads.max_declared_size,
        max_parallel_chunks: uploads.max_parallel_chunks,
        allowed_mime_types: uploads.allowed_mime_types.clone(),
        supports_resume: true,
        retry: RetryCapabilities {
            max_attempts: tasks.retry.max_attempts,
            initial_backoff_ms: tasks.retry.initial_backoff_ms,
            backoff_multiplier: tasks.retry.backoff_multiplier,
            max_backoff_ms: tasks.retry.max_backoff_ms,
        },
        max_refine_passes: tasks.max_refine_passes,
        api_version: quire_core::API_VERSION,
    }))
}
