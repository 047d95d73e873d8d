use anyhow::{Context, Result};
use bytes::{Buf, BytesMut};
use futures::{Stream, StreamExt};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// A non-success response from the gateway, with its stable error code.
#[derive(Debug, thiserror::Error)]
#[error("API error ({status}): {code}: {message}")]
pub struct RequestError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl RequestError {
    async fn from_response(response: reqwest::Response) -> Self {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorResponse>(&body) {
            Ok(err) => Self {
                status,
                code: err.code,
                message: err.message,
            },
            Err(_) => Self {
                status,
                code: "unknown".to_string(),
                message: body,
            },
        }
    }

    /// Transport-level conditions worth retrying: timeouts, throttling and
    /// server errors.
    pub fn is_retryable(&self) -> bool {
        self.status.is_server_error()
            || self.status == StatusCode::REQUEST_TIMEOUT
            || self.status == StatusCode::TOO_MANY_REQUESTS
    }
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url).context("invalid server URL")?;
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).context("failed to build API URL")
    }

    async fn send_json<T: DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> Result<T> {
        let response = req.send().await?;
        if !response.status().is_success() {
            return Err(RequestError::from_response(response).await.into());
        }
        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn send_empty(&self, req: reqwest::RequestBuilder) -> Result<()> {
        let response = req.send().await?;
        if !response.status().is_success() {
            return Err(RequestError::from_response(response).await.into());
        }
        Ok(())
    }

    pub async fn health(&self) -> Result<HealthResponse> {
        let url = self.url("/v1/health")?;
        self.send_json(self.http.get(url)).await
    }

    pub async fn capabilities(&self) -> Result<CapabilitiesResponse> {
        let url = self.url("/v1/capabilities")?;
        self.send_json(self.http.get(url)).await
    }

    pub async fn init_upload(&self, req: InitUploadRequest) -> Result<InitUploadResponse> {
        let url = self.url("/v1/uploads")?;
        self.send_json(self.http.post(url).json(&req)).await
    }

    pub async fn upload_chunk(
        &self,
        upload_id: &str,
        index: u32,
        data: bytes::Bytes,
    ) -> Result<ChunkReceipt> {
        let url = self.url(&format!("/v1/uploads/{upload_id}/chunks/{index}"))?;
        self.send_json(
            self.http
                .post(url)
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(data),
        )
        .await
    }

    pub async fn complete_upload(&self, upload_id: &str) -> Result<CompleteUploadResponse> {
        let url = self.url(&format!("/v1/uploads/{upload_id}/complete"))?;
        self.send_json(self.http.post(url)).await
    }

    pub async fn upload_status(&self, upload_id: &str) -> Result<UploadStatusResponse> {
        let url = self.url(&format!("/v1/uploads/{upload_id}"))?;
        self.send_json(self.http.get(url)).await
    }

    pub async fn abort_upload(&self, upload_id: &str) -> Result<()> {
        let url = self.url(&format!("/v1/uploads/{upload_id}"))?;
        self.send_empty(self.http.delete(url)).await
    }

    pub async fn start_generate(&self, req: StartTaskRequest) -> Result<StartTaskResponse> {
        let url = self.url("/v1/tasks/generate")?;
        self.send_json(self.http.post(url).json(&req)).await
    }

    pub async fn start_refine(&self, req: StartTaskRequest) -> Result<StartTaskResponse> {
        let url = self.url("/v1/tasks/refine")?;
        self.send_json(self.http.post(url).json(&req)).await
    }

    pub async fn task_status(&self, task_id: &str) -> Result<TaskStatusResponse> {
        let url = self.url(&format!("/v1/tasks/{task_id}"))?;
        self.send_json(self.http.get(url)).await
    }

    pub async fn cancel_task(&self, task_id: &str) -> Result<CancelTaskResponse> {
        let url = self.url(&format!("/v1/tasks/{task_id}/cancel"))?;
        self.send_json(self.http.post(url)).await
    }

    pub async fn task_output(&self, task_id: &str) -> Result<TaskOutput> {
        let url = self.url(&format!("/v1/tasks/{task_id}/output"))?;
        self.send_json(self.http.get(url)).await
    }

    /// Open the task's event stream starting at `from_sequence`.
    ///
    /// The stream ends when the server closes the connection, which it does
    /// after the terminal event. A dropped connection ends it early; callers
    /// reconnect from the last sequence they saw plus one.
    pub async fn events(
        &self,
        task_id: &str,
        from_sequence: u64,
    ) -> Result<impl Stream<Item = Result<ProgressEvent>>> {
        let mut url = self.url(&format!("/v1/tasks/{task_id}/events"))?;
        url.query_pairs_mut()
            .append_pair("from_sequence", &from_sequence.to_string());
        let response = self
            .http
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(RequestError::from_response(response).await.into());
        }

        let body = response.bytes_stream();
        Ok(async_stream::try_stream! {
            let mut body = std::pin::pin!(body);
            let mut decoder = SseDecoder::default();
            while let Some(chunk) = body.next().await {
                decoder.push(&chunk?);
                while let Some(frame) = decoder.next_frame() {
                    if frame.event.as_deref().unwrap_or("message") != "progress" {
                        continue;
                    }
                    let event: ProgressEvent = serde_json::from_str(&frame.data)
                        .context("malformed progress event")?;
                    yield event;
                }
            }
        })
    }
}

/// One dispatched server-sent event.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
}

/// Incremental `text/event-stream` parser.
///
/// Frames are separated by a blank line. Comment lines (leading `:`) and
/// frames without data, such as keep-alives, are skipped.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: BytesMut,
}

impl SseDecoder {
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn next_frame(&mut self) -> Option<SseFrame> {
        loop {
            let (end, sep) = find_frame_end(&self.buf)?;
            let raw = self.buf.split_to(end);
            self.buf.advance(sep);

            let text = String::from_utf8_lossy(&raw);
            let mut frame = SseFrame::default();
            let mut data_lines = Vec::new();
            for line in text.lines() {
                if line.starts_with(':') {
                    continue;
                }
                let (field, value) = match line.split_once(':') {
                    Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                    None => (line, ""),
                };
                match field {
                    "id" => frame.id = Some(value.to_string()),
                    "event" => frame.event = Some(value.to_string()),
                    "data" => data_lines.push(value),
                    _ => {}
                }
            }
            if data_lines.is_empty() {
                continue;
            }
            frame.data = data_lines.join("\n");
            return Some(frame);
        }
    }
}

/// Position and length of the first blank-line separator.
fn find_frame_end(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|i| (i, 2));
    let crlf = buf
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

// =============================================================================
// Request/Response types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Deserialize)]
pub struct RetryCapabilities {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct CapabilitiesResponse {
    pub max_chunk_body_size: u64,
    pub max_total_chunks: u32,
    pub max_declared_size: u64,
    pub max_parallel_chunks: u32,
    pub allowed_mime_types: Vec<String>,
    pub supports_resume: bool,
    pub retry: RetryCapabilities,
    pub max_refine_passes: u32,
    pub api_version: String,
}

#[derive(Debug, Serialize)]
pub struct InitUploadRequest {
    pub filename: String,
    pub file_size: i64,
    pub file_type: String,
    pub total_chunks: i64,
}

#[derive(Debug, Deserialize)]
pub struct InitUploadResponse {
    pub upload_id: String,
    pub max_parallel_chunks: u32,
}

#[derive(Debug, Deserialize)]
pub struct ChunkReceipt {
    pub upload_id: String,
    pub chunk_index: u32,
    pub received_count: u32,
    pub total_chunks: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactRef {
    pub upload_id: String,
    pub key: String,
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
    pub sha256: String,
}

#[derive(Debug, Deserialize)]
pub struct CompleteUploadResponse {
    pub upload_id: String,
    pub artifact_ref: ArtifactRef,
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct UploadStatusResponse {
    pub upload_id: String,
    pub filename: String,
    pub received_count: u32,
    pub total_chunks: u32,
    pub state: String,
    #[serde(default)]
    pub missing_chunks: Vec<u32>,
    pub artifact_ref: Option<ArtifactRef>,
    pub reason: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct TaskOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passes: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct StartTaskRequest {
    pub input_refs: Vec<String>,
    pub options: TaskOptions,
}

#[derive(Debug, Deserialize)]
pub struct StartTaskResponse {
    pub task_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CancelTaskResponse {
    pub accepted: bool,
    pub stage: String,
}

#[derive(Debug, Deserialize)]
pub struct TaskStatusResponse {
    pub task_id: String,
    pub kind: String,
    pub stage: String,
    pub progress_percent: u8,
    pub message: String,
    pub attempt: u32,
    pub reason: Option<String>,
    pub output_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OutputSection {
    pub source: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct TaskOutput {
    pub task_id: String,
    pub kind: String,
    pub content: String,
    #[serde(default)]
    pub sections: Vec<OutputSection>,
    pub created_at: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgressEvent {
    pub task_id: String,
    pub sequence: u64,
    pub stage: String,
    pub progress_percent: u8,
    pub message: String,
    #[serde(default)]
    pub attempt: u32,
    pub reason: Option<String>,
    pub timestamp: String,
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self.stage.as_str(), "completed" | "failed" | "cancelled")
    }
}
