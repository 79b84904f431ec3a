//! Completion proxy
//!
//! Forwards authorized requests to the completion backend, classifies
//! budget/rate-limit failures into the closed error-code contract, and
//! relays streaming responses without buffering. Once bytes have been
//! relayed, later upstream failures cannot change the response status;
//! they are logged and the stream is closed.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::http::{header, StatusCode};
use axum::response::Response;
use futures::Stream;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::Config;
use crate::error::ApiError;

/// Generic client-facing message for upstream failures.
const GENERIC_UPSTREAM_ERROR: &str = "Upstream service returned an error";

/// Sanitized completion parameters exposed to clients.
///
/// This is the whitelist of OpenAI-compatible parameters the gateway is
/// willing to forward; anything else in the request body is dropped at
/// deserialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize, utoipa::ToSchema)]
pub struct ChatRequest {
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    #[schema(value_type = Vec<Object>)]
    pub messages: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mock_response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub tools: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub tool_choice: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub stream_options: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub stop: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub logit_bias: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub response_format: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_tool_calls: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logprobs: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_logprobs: Option<u32>,
}

impl ChatRequest {
    /// Fill unset sampling parameters from the configured defaults.
    pub fn apply_defaults(&mut self, config: &Config) {
        if self.model.is_none() {
            self.model = Some(config.default_model.clone());
        }
        if self.temperature.is_none() {
            self.temperature = Some(config.default_temperature);
        }
        if self.max_completion_tokens.is_none() {
            self.max_completion_tokens = Some(config.default_max_completion_tokens);
        }
        if self.top_p.is_none() {
            self.top_p = Some(config.default_top_p);
        }
    }
}

/// A chat request that passed the authorization dispatcher.
#[derive(Debug, Clone)]
pub struct AuthorizedRequest {
    /// Canonical principal (`"{identity}:{service_type}"`)
    pub user: String,
    pub request: ChatRequest,
}

/// SHA-256 of the canonical JSON form of the request payload.
///
/// This is the digest a device assertion must have signed. Canonical form
/// is the sanitized request serialized with object keys sorted, so the
/// digest is stable across serialization order.
pub fn payload_hash(request: &ChatRequest) -> Result<[u8; 32], ApiError> {
    let value = serde_json::to_value(request)
        .map_err(|e| ApiError::internal(format!("Failed to canonicalize request: {e}")))?;
    let canonical = serde_json::to_vec(&sort_keys(value))
        .map_err(|e| ApiError::internal(format!("Failed to canonicalize request: {e}")))?;
    Ok(Sha256::digest(&canonical).into())
}

fn sort_keys(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<(String, serde_json::Value)> =
                map.into_iter().map(|(k, v)| (k, sort_keys(v))).collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            serde_json::Value::Object(entries.into_iter().collect())
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(sort_keys).collect())
        }
        other => other,
    }
}

/// Quota failure categories reported by the completion backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    Budget,
    Rate,
}

/// Classify an upstream error body as a budget or rate-limit failure.
///
/// Pure function of the body content: the backend reports both through the
/// error `type`/`message` text. Budget wins when both keywords appear.
pub fn classify_limit_error(body: &str) -> Option<LimitKind> {
    let parsed: serde_json::Value = serde_json::from_str(body).ok()?;
    let error = parsed.get("error")?;
    let text = format!(
        "{} {}",
        error.get("type").and_then(|v| v.as_str()).unwrap_or(""),
        error.get("message").and_then(|v| v.as_str()).unwrap_or(""),
    )
    .to_lowercase();

    if text.contains("budget") {
        Some(LimitKind::Budget)
    } else if text.contains("rate") {
        Some(LimitKind::Rate)
    } else {
        None
    }
}

/// HTTP client for the completion backend.
pub struct CompletionClient {
    http_client: reqwest::Client,
    completions_url: String,
    virtual_key: String,
    debug: bool,
}

impl CompletionClient {
    pub fn new(http_client: reqwest::Client, config: &Config) -> Self {
        Self {
            http_client,
            completions_url: config.completions_url(),
            virtual_key: config.upstream_virtual_key.clone(),
            debug: config.debug,
        }
    }

    fn body(&self, authorized: &AuthorizedRequest, stream: bool) -> serde_json::Value {
        let request = &authorized.request;
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": request.messages,
            "temperature": request.temperature,
            "top_p": request.top_p,
            "max_tokens": request.max_completion_tokens,
            "user": authorized.user,
            "stream": stream,
        });
        if !stream {
            if let Some(mock) = &request.mock_response {
                body["mock_response"] = serde_json::Value::String(mock.clone());
            }
        }
        body
    }

    /// Map an upstream error response to the domain error contract.
    async fn upstream_error(&self, response: reqwest::Response) -> ApiError {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if status.as_u16() == 429 || status.as_u16() == 400 {
            match classify_limit_error(&text) {
                Some(LimitKind::Budget) => {
                    tracing::warn!(body = %text, "Upstream reported budget exhaustion");
                    return ApiError::BudgetExceeded;
                }
                Some(LimitKind::Rate) => {
                    tracing::warn!(body = %text, "Upstream reported rate limit");
                    return ApiError::RateLimited;
                }
                None => {}
            }
        }

        tracing::error!(status = %status, body = %text, "Upstream returned an error");
        ApiError::Upstream {
            status: StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY),
            message: if self.debug && !text.is_empty() {
                text
            } else {
                GENERIC_UPSTREAM_ERROR.to_string()
            },
        }
    }

    /// Proxy a non-streaming completion and return the backend payload
    /// unchanged.
    pub async fn complete(
        &self,
        authorized: &AuthorizedRequest,
    ) -> Result<serde_json::Value, ApiError> {
        let started = Instant::now();
        let model = authorized.request.model.clone().unwrap_or_default();
        tracing::debug!(model = %model, user = %authorized.user, "Starting completion");

        let response = self
            .http_client
            .post(&self.completions_url)
            .bearer_auth(&self.virtual_key)
            .json(&self.body(authorized, false))
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, url = %self.completions_url, "Failed to proxy request");
                ApiError::ProxyFailure("Failed to proxy request".to_string())
            })?;

        if !response.status().is_success() {
            return Err(self.upstream_error(response).await);
        }

        let data: serde_json::Value = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "Upstream returned malformed completion body");
            ApiError::ProxyFailure("Failed to proxy request".to_string())
        })?;

        let usage = data.get("usage").cloned().unwrap_or_default();
        tracing::info!(
            model = %model,
            user = %authorized.user,
            prompt_tokens = usage.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
            completion_tokens = usage.get("completion_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
            latency_ms = started.elapsed().as_millis() as u64,
            "Completion finished"
        );

        Ok(data)
    }

    /// Proxy a streaming completion, relaying backend bytes verbatim.
    ///
    /// Budget/rate classification applies to the initial response only; a
    /// failure after the first relayed byte can no longer change the
    /// status and only closes the stream.
    pub async fn stream(&self, authorized: &AuthorizedRequest) -> Result<Response, ApiError> {
        let started = Instant::now();
        let model = authorized.request.model.clone().unwrap_or_default();
        tracing::debug!(model = %model, user = %authorized.user, "Starting stream completion");

        let response = self
            .http_client
            .post(&self.completions_url)
            .bearer_auth(&self.virtual_key)
            .json(&self.body(authorized, true))
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, url = %self.completions_url, "Failed to proxy request");
                ApiError::ProxyFailure("Failed to proxy request".to_string())
            })?;

        if !response.status().is_success() {
            return Err(self.upstream_error(response).await);
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("text/event-stream")
            .to_string();

        let relay = UsageRelay::new(Box::pin(response.bytes_stream()), model, started);

        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from_stream(relay))
            .map_err(|e| ApiError::internal(format!("Failed to build stream response: {e}")))
    }
}

impl std::fmt::Debug for CompletionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionClient")
            .field("completions_url", &self.completions_url)
            .finish()
    }
}

/// Pull-based relay that accounts for usage as chunks cross the wire.
///
/// Accounting is a fold over the stream and never gates back-pressure.
/// Totals are emitted on drop so cancellation (client disconnect) still
/// finalizes the numbers and releases the upstream connection.
struct UsageRelay<S> {
    inner: S,
    model: String,
    started: Instant,
    first_chunk_at: Option<Instant>,
    chunks: u64,
    failed: bool,
    done: bool,
}

impl<S> UsageRelay<S> {
    fn new(inner: S, model: String, started: Instant) -> Self {
        Self {
            inner,
            model,
            started,
            first_chunk_at: None,
            chunks: 0,
            failed: false,
            done: false,
        }
    }
}

impl<S> Stream for UsageRelay<S>
where
    S: Stream<Item = reqwest::Result<Bytes>> + Unpin,
{
    type Item = Result<Bytes, std::convert::Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if this.first_chunk_at.is_none() {
                    this.first_chunk_at = Some(Instant::now());
                    tracing::debug!(
                        model = %this.model,
                        ttfb_ms = this.started.elapsed().as_millis() as u64,
                        "First upstream chunk relayed"
                    );
                }
                this.chunks += 1;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                // The status line is already on the wire; close the relay.
                tracing::error!(model = %this.model, error = %e, "Upstream stream failed mid-relay");
                this.failed = true;
                Poll::Ready(None)
            }
            Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S> Drop for UsageRelay<S> {
    fn drop(&mut self) {
        let outcome = if self.failed {
            "failed"
        } else if self.done {
            "completed"
        } else {
            "cancelled"
        };
        tracing::info!(
            model = %self.model,
            chunks = self.chunks,
            outcome = outcome,
            ttfb_ms = self
                .first_chunk_at
                .map(|t| t.duration_since(self.started).as_millis() as u64),
            duration_ms = self.started.elapsed().as_millis() as u64,
            "Stream completion finished"
        );
    }
}
