//! JSON-over-HTTP generation endpoint.

use super::{GenerationError, GenerationRequest, Generator};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Longest slice of an error body carried into a failure reason.
const MAX_ERROR_BODY: usize = 512;

#[derive(Serialize)]
struct InvokeBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    #[serde(flatten)]
    request: &'a GenerationRequest,
}

#[derive(Deserialize)]
struct InvokeResponse {
    #[serde(alias = "output")]
    content: String,
}

/// Calls a remote endpoint with the request as JSON and expects
/// `{"content": "..."}` back.
pub struct HttpGenerator {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: Option<String>,
}

impl HttpGenerator {
    pub fn new(
        endpoint: &str,
        api_key: Option<String>,
        model: Option<String>,
        connect_timeout: Duration,
    ) -> Result<Self, GenerationError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("quire/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| GenerationError::Fatal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            model,
        })
    }
}

/// 408, 429 and any 5xx are worth retrying.
fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

fn classify_transport(err: reqwest::Error) -> GenerationError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        GenerationError::Transient(err.to_string())
    } else {
        GenerationError::Fatal(err.to_string())
    }
}

fn truncate(body: &str) -> &str {
    if body.len() <= MAX_ERROR_BODY {
        return body;
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn invoke(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        let body = InvokeBody {
            model: self.model.as_deref(),
            request,
        };
        let mut builder = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(classify_transport)?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let reason = format!("endpoint returned {status}: {}", truncate(text.trim()));
            return Err(if is_transient_status(status) {
                GenerationError::Transient(reason)
            } else {
                GenerationError::Fatal(reason)
            });
        }

        let bytes = response.bytes().await.map_err(classify_transport)?;
        let parsed: InvokeResponse = serde_json::from_slice(&bytes)
            .map_err(|e| GenerationError::Fatal(format!("malformed response body: {e}")))?;
        debug!(
            task_id = %request.task_id,
            step = request.step,
            len = parsed.content.len(),
            "generation step returned"
        );
        Ok(parsed.content)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
