//! Request helpers and upload fixtures.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use bytes::Bytes;
use serde_json::{Value, json};
use tower::ServiceExt;

/// Generate deterministic printable test data based on a seed.
#[allow(dead_code)]
pub fn seeded_text(seed: u64, len: usize) -> Bytes {
    let mut state = seed;
    let data: Vec<u8> = (0..len)
        .map(|_| {
            // Simple LCG for deterministic data
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            b'a' + (state >> 59) as u8 % 26
        })
        .collect();
    Bytes::from(data)
}

/// Helper to make JSON requests.
#[allow(dead_code)]
pub async fn json_request(
    router: &axum::Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(v) => {
            builder = builder.header("Content-Type", "application/json");
            Body::from(serde_json::to_vec(&v).unwrap())
        }
        None => Body::empty(),
    };
    send(router, builder.body(body).unwrap()).await
}

/// Helper to upload raw chunk bytes.
#[allow(dead_code)]
pub async fn put_chunk(
    router: &axum::Router,
    upload_id: &str,
    index: i64,
    data: Bytes,
) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(format!("/v1/uploads/{upload_id}/chunks/{index}"))
        .header("Content-Type", "application/octet-stream")
        .body(Body::from(data))
        .unwrap();
    send(router, request).await
}

#[allow(dead_code)]
pub async fn send(router: &axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: Value = if body_bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body_bytes).unwrap_or(Value::Null)
    };
    (status, json)
}

/// Create an upload session, returning its ID.
#[allow(dead_code)]
pub async fn init_upload(
    router: &axum::Router,
    filename: &str,
    file_type: &str,
    file_size: usize,
    total_chunks: usize,
) -> String {
    let (status, body) = json_request(
        router,
        "POST",
        "/v1/uploads",
        Some(json!({
            "filename": filename,
            "file_size": file_size,
            "file_type": file_type,
            "total_chunks": total_chunks,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "init failed: {body}");
    body["upload_id"].as_str().unwrap().to_string()
}

/// Upload `data` as a completed text artifact, returning its input reference.
#[allow(dead_code)]
pub async fn completed_upload(router: &axum::Router, filename: &str, data: &[u8]) -> String {
    let upload_id = init_upload(router, filename, "text/plain", data.len(), 1).await;
    let (status, body) = put_chunk(router, &upload_id, 0, Bytes::copy_from_slice(data)).await;
    assert_eq!(status, StatusCode::OK, "chunk failed: {body}");
    let (status, body) = json_request(
        router,
        "POST",
        &format!("/v1/uploads/{upload_id}/complete"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK, "complete failed: {body}");
    format!("upload:{upload_id}")
}
