//! Upload handlers.

use crate::error::{ApiError, ApiResult};
use crate::metrics::{
    ASSEMBLY_DURATION, BYTES_RECEIVED, CHUNK_WRITE_DURATION, CHUNKS_RECEIVED,
    DUPLICATE_CHUNKS_REJECTED, UPLOAD_SESSIONS_COMPLETED, UPLOAD_SESSIONS_CREATED,
    UPLOAD_SESSIONS_EXPIRED, UPLOAD_SESSIONS_FAILED, record_upload_error,
};
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use quire_core::UploadId;
use quire_core::upload::{
    ChunkReceipt, CompleteUploadResponse, InitUploadRequest, InitUploadResponse,
    UploadStatusResponse,
};
use quire_engine::UploadError;
use std::time::Instant;

/// Maximum request body size for init requests (64 KiB).
const MAX_INIT_BODY_SIZE: usize = 64 * 1024;

pub(crate) fn parse_upload_id(raw: &str) -> ApiResult<UploadId> {
    UploadId::parse(raw).map_err(|e| ApiError::BadRequest(format!("invalid upload ID: {e}")))
}

/// Count the failure by code before handing it back.
fn rejected(err: UploadError) -> ApiError {
    match &err {
        UploadError::DuplicateChunk(_) => DUPLICATE_CHUNKS_REJECTED.inc(),
        UploadError::AssemblyFailed(_) => UPLOAD_SESSIONS_FAILED.inc(),
        _ => {}
    }
    let err = ApiError::from(err);
    record_upload_error(err.code());
    err
}

/// POST /v1/uploads
#[tracing::instrument(skip(state, req), fields(upload_id))]
pub async fn create_upload(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<(StatusCode, Json<InitUploadResponse>)> {
    let body: InitUploadRequest = {
        let bytes = axum::body::to_bytes(req.into_body(), MAX_INIT_BODY_SIZE)
            .await
            .map_err(|e| ApiError::BadRequest(format!("failed to read body: {e}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ApiError::BadRequest(format!("invalid JSON: {e}")))?
    };

    let session = state
        .uploads
        .init(
            &body.filename,
            body.total_chunks,
            body.file_size,
            &body.file_type,
        )
        .await
        .map_err(rejected)?;
    tracing::Span::current().record("upload_id", tracing::field::display(session.id));
    UPLOAD_SESSIONS_CREATED.inc();

    Ok((
        StatusCode::CREATED,
        Json(InitUploadResponse {
            upload_id: session.id,
            max_parallel_chunks: state.config.uploads.max_parallel_chunks,
        }),
    ))
}

/// POST /v1/uploads/{upload_id}/chunks/{chunk_index}
///
/// The request body is the raw chunk bytes.
#[tracing::instrument(skip(state, req), fields(upload_id = %upload_id, chunk_index = %chunk_index))]
pub async fn upload_chunk(
    State(state): State<AppState>,
    Path((upload_id, chunk_index)): Path<(String, String)>,
    req: Request,
) -> ApiResult<Json<ChunkReceipt>> {
    let start_time = Instant::now();
    let upload_id = parse_upload_id(&upload_id)?;
    let index: i64 = chunk_index
        .parse()
        .map_err(|e| ApiError::BadRequest(format!("invalid chunk index: {e}")))?;

    let limit = usize::try_from(state.config.server.max_chunk_body_size).unwrap_or(usize::MAX);
    let data = axum::body::to_bytes(req.into_body(), limit)
        .await
        .map_err(|e| ApiError::BadRequest(format!("failed to read chunk: {e}")))?;
    let size = data.len() as u64;

    let receipt = state
        .uploads
        .receive_chunk(upload_id, index, data)
        .await
        .map_err(rejected)?;

    CHUNKS_RECEIVED.inc();
    BYTES_RECEIVED.inc_by(size);
    CHUNK_WRITE_DURATION.observe(start_time.elapsed().as_secs_f64());
    Ok(Json(receipt))
}

/// POST /v1/uploads/{upload_id}/complete
#[tracing::instrument(skip(state), fields(upload_id = %upload_id))]
pub async fn complete_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> ApiResult<Json<CompleteUploadResponse>> {
    let start_time = Instant::now();
    let upload_id = parse_upload_id(&upload_id)?;

    let completion = state.uploads.complete(upload_id).await.map_err(rejected)?;
    let session = state.uploads.status(upload_id).await.map_err(rejected)?;

    if completion.assembled {
        UPLOAD_SESSIONS_COMPLETED.inc();
        ASSEMBLY_DURATION.observe(start_time.elapsed().as_secs_f64());
    }
    Ok(Json(CompleteUploadResponse {
        upload_id,
        artifact_ref: completion.artifact,
        status: session.state,
    }))
}

/// GET /v1/uploads/{upload_id}
#[tracing::instrument(skip(state), fields(upload_id = %upload_id))]
pub async fn get_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> ApiResult<Json<UploadStatusResponse>> {
    let upload_id = parse_upload_id(&upload_id)?;
    let session = state.uploads.status(upload_id).await?;
    Ok(Json(UploadStatusResponse::from(&session)))
}

/// DELETE /v1/uploads/{upload_id}
#[tracing::instrument(skip(state), fields(upload_id = %upload_id))]
pub async fn abort_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> ApiResult<StatusCode> {
    let upload_id = parse_upload_id(&upload_id)?;
    state.uploads.abort(upload_id).await.map_err(rejected)?;
    UPLOAD_SESSIONS_EXPIRED.inc();
    Ok(StatusCode::NO_CONTENT)
}
