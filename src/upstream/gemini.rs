//! Gemini (Generative Language API) transport.
//!
//! Unary calls use `models/{model}:generateContent`; streamed calls use
//! `models/{model}:streamGenerateContent?alt=sse` and decode the
//! server-sent events incrementally. HTTP and payload errors are
//! classified into [`FailureKind`] here and nowhere else.
//!
//! See: <https://ai.google.dev/api/generate-content>

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use super::transport::{ChunkStream, TransportResult, UpstreamTransport};
use crate::error::{FailureKind, UpstreamFailure};
use crate::types::{FinishReason, InvokeRequest, StreamChunk, UpstreamResponse, Usage};

/// Default base URL for the Generative Language API
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

const API_VERSION: &str = "v1beta";

/// Upper bound on a backend `Retry-After` hint.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Largest single server-sent event accepted before the stream fails.
pub(crate) const MAX_SSE_EVENT_BYTES: usize = 4 * 1024 * 1024;

/// Transport for Google's Gemini models.
#[derive(Clone)]
pub struct GeminiTransport {
    api_key: String,
    http: Client,
    base_url: String,
}

impl GeminiTransport {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(api_key, DEFAULT_BASE_URL)
    }

    /// Create a transport with a custom base URL (for testing with wiremock).
    ///
    /// No client-level timeout is set: attempt timeouts and the operation
    /// deadline are enforced by [`UpstreamClient`](super::UpstreamClient).
    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self::with_http_client(api_key, base_url, Client::new())
    }

    /// Create a transport sharing an existing HTTP client.
    pub fn with_http_client(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        http: Client,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn post(&self, url: &str, body: &Value) -> TransportResult<reqwest::Response> {
        let response = self
            .http
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(body)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(|secs| Duration::from_secs(secs).min(MAX_RETRY_AFTER));
        let text = response.text().await.unwrap_or_default();
        Err(classify_status(status.as_u16(), retry_after, &text))
    }
}

#[async_trait]
impl UpstreamTransport for GeminiTransport {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn call(
        &self,
        request: &InvokeRequest,
        model: &str,
    ) -> TransportResult<UpstreamResponse> {
        let body = build_request_body(request)?;
        let url = format!(
            "{}/{API_VERSION}/models/{model}:generateContent",
            self.base_url
        );

        let response = self.post(&url, &body).await?;
        let payload: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| UpstreamFailure::new(FailureKind::Internal, e.to_string()))?;

        payload.into_response(model)
    }

    async fn call_stream(
        &self,
        request: &InvokeRequest,
        model: &str,
    ) -> TransportResult<ChunkStream> {
        let body = build_request_body(request)?;
        let url = format!(
            "{}/{API_VERSION}/models/{model}:streamGenerateContent?alt=sse",
            self.base_url
        );

        let response = self.post(&url, &body).await?;
        Ok(sse_chunks(response.bytes_stream()))
    }
}

// ============================================================================
// Request building
// ============================================================================

/// Build a `generateContent` body from request parameters.
///
/// Recognised parameters: `contents` (passed through verbatim), `prompt`,
/// `media` (object or array of `{mime_type, data}` with base64 data),
/// `temperature`, `max_tokens`, `top_p`, `top_k`, `stop_sequences`.
pub(crate) fn build_request_body(request: &InvokeRequest) -> TransportResult<Value> {
    let params = &request.params;

    let contents = match params.get("contents") {
        Some(Value::Array(contents)) => Value::Array(contents.clone()),
        Some(_) => {
            return Err(UpstreamFailure::new(
                FailureKind::MalformedRequest,
                "`contents` must be an array",
            ));
        }
        None => {
            let mut parts = Vec::new();
            if let Some(prompt) = params.get("prompt").and_then(Value::as_str) {
                parts.push(json!({ "text": prompt }));
            }
            match params.get("media") {
                Some(Value::Array(items)) => {
                    for item in items {
                        parts.push(inline_data(item)?);
                    }
                }
                Some(item) => parts.push(inline_data(item)?),
                None => {}
            }
            if parts.is_empty() {
                return Err(UpstreamFailure::new(
                    FailureKind::MalformedRequest,
                    format!("{} request has neither prompt nor media", request.operation),
                ));
            }
            json!([{ "role": "user", "parts": parts }])
        }
    };

    let mut config = Map::new();
    for (from, to) in [
        ("temperature", "temperature"),
        ("max_tokens", "maxOutputTokens"),
        ("top_p", "topP"),
        ("top_k", "topK"),
        ("stop_sequences", "stopSequences"),
    ] {
        if let Some(value) = params.get(from).filter(|v| !v.is_null()) {
            config.insert(to.to_string(), value.clone());
        }
    }

    let mut body = Map::new();
    body.insert("contents".to_string(), contents);
    if !config.is_empty() {
        body.insert("generationConfig".to_string(), Value::Object(config));
    }
    Ok(Value::Object(body))
}

fn inline_data(item: &Value) -> TransportResult<Value> {
    let mime_type = item.get("mime_type").and_then(Value::as_str);
    let data = item.get("data").and_then(Value::as_str);
    match (mime_type, data) {
        (Some(mime_type), Some(data)) => Ok(json!({
            "inline_data": { "mime_type": mime_type, "data": data }
        })),
        _ => Err(UpstreamFailure::new(
            FailureKind::MalformedRequest,
            "media entries need `mime_type` and base64 `data`",
        )),
    }
}

// ============================================================================
// Error classification
// ============================================================================

/// Map an HTTP error status to a failure kind.
pub(crate) fn classify_status(
    status: u16,
    retry_after: Option<Duration>,
    body: &str,
) -> UpstreamFailure {
    let message = serde_json::from_str::<ErrorEnvelope>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| format!("HTTP {status}"));

    let kind = match status {
        400 => FailureKind::MalformedRequest,
        401 | 403 => FailureKind::Authentication,
        404 => FailureKind::NotFound,
        408 => FailureKind::Timeout,
        429 => FailureKind::Throttled,
        500 | 502 | 503 | 504 => FailureKind::Unavailable,
        _ => FailureKind::Internal,
    };

    UpstreamFailure {
        kind,
        message,
        retry_after: if kind == FailureKind::Throttled {
            retry_after
        } else {
            None
        },
    }
}

fn classify_transport_error(err: reqwest::Error) -> UpstreamFailure {
    let kind = if err.is_timeout() {
        FailureKind::Timeout
    } else if err.is_connect() || err.is_request() || err.is_body() {
        FailureKind::Network
    } else {
        FailureKind::Internal
    };
    UpstreamFailure::new(kind, err.to_string())
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<u16>,
    message: String,
}

// ============================================================================
// Response decoding
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
    #[serde(default)]
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
    #[serde(default)]
    total_token_count: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

impl GenerateContentResponse {
    /// Policy rejections come back as 200s; surface them as failures.
    fn policy_violation(&self) -> Option<UpstreamFailure> {
        if let Some(reason) = self
            .prompt_feedback
            .as_ref()
            .and_then(|f| f.block_reason.as_deref())
        {
            return Some(UpstreamFailure::new(
                FailureKind::PolicyRejection,
                format!("prompt blocked: {reason}"),
            ));
        }
        let finish = self.candidates.first()?.finish_reason.as_deref()?;
        matches!(finish, "SAFETY" | "PROHIBITED_CONTENT" | "BLOCKLIST" | "SPII").then(|| {
            UpstreamFailure::new(
                FailureKind::PolicyRejection,
                format!("response blocked: {finish}"),
            )
        })
    }

    fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|content| {
                content
                    .parts
                    .iter()
                    .filter_map(|p| p.text.as_deref())
                    .collect::<String>()
            })
            .unwrap_or_default()
    }

    fn into_response(self, model: &str) -> TransportResult<UpstreamResponse> {
        if let Some(failure) = self.policy_violation() {
            return Err(failure);
        }
        if self.candidates.is_empty() {
            return Err(UpstreamFailure::new(
                FailureKind::Internal,
                "response contained no candidates",
            ));
        }

        let text = self.text();
        let finish_reason = match self
            .candidates
            .first()
            .and_then(|c| c.finish_reason.as_deref())
        {
            None | Some("STOP") => FinishReason::Stop,
            Some("MAX_TOKENS") => FinishReason::Length,
            Some(other) => FinishReason::Other(other.to_string()),
        };

        let mut response = UpstreamResponse::new(
            text,
            self.model_version.unwrap_or_else(|| model.to_string()),
        )
        .with_finish_reason(finish_reason);
        if let Some(usage) = self.usage_metadata {
            response = response.with_usage(Usage {
                prompt_tokens: usage.prompt_token_count,
                completion_tokens: usage.candidates_token_count,
                total_tokens: usage.total_token_count,
            });
        }
        Ok(response)
    }
}

// ============================================================================
// Server-sent events
// ============================================================================

/// Incremental decoder for `text/event-stream` bodies.
///
/// Buffers raw bytes until a blank line terminates an event, so multi-byte
/// characters split across network reads decode correctly. A pending event
/// larger than `limit` fails the stream.
#[derive(Debug)]
pub(crate) struct SseDecoder {
    buffer: Vec<u8>,
    /// Offset below which the buffer holds no event terminator.
    scanned: usize,
    limit: usize,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_limit(MAX_SSE_EVENT_BYTES)
    }
}

impl SseDecoder {
    pub(crate) fn with_limit(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            limit,
        }
    }

    /// Feed bytes; returns the `data` payload of every completed event.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> TransportResult<Vec<String>> {
        self.buffer.extend(bytes.iter().copied().filter(|b| *b != b'\r'));
        let mut events = Vec::new();
        loop {
            // Back up one byte so a terminator split across reads is found.
            let from = self.scanned.saturating_sub(1);
            match self.buffer[from..].windows(2).position(|w| w == b"\n\n") {
                Some(pos) => {
                    let block: Vec<u8> = self.buffer.drain(..from + pos + 2).collect();
                    self.scanned = 0;
                    if let Some(data) = event_data(&block) {
                        events.push(data);
                    }
                }
                None => {
                    self.scanned = self.buffer.len();
                    break;
                }
            }
        }
        if self.buffer.len() > self.limit {
            self.buffer.clear();
            self.scanned = 0;
            return Err(UpstreamFailure::new(
                FailureKind::Internal,
                format!("stream event exceeds {} bytes", self.limit),
            ));
        }
        Ok(events)
    }

    /// Flush a trailing event not terminated by a blank line.
    pub(crate) fn finish(&mut self) -> Option<String> {
        let block = std::mem::take(&mut self.buffer);
        event_data(&block)
    }
}

fn event_data(block: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(block);
    let data: Vec<&str> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|d| d.strip_prefix(' ').unwrap_or(d))
        .collect();
    if data.is_empty() {
        return None;
    }
    Some(data.join("\n"))
}

/// Decode one SSE `data` payload into a chunk.
///
/// Returns `None` for payloads that carry no text (e.g. a trailing
/// usage-only event).
pub(crate) fn decode_event(data: &str) -> Option<TransportResult<StreamChunk>> {
    if data.trim() == "[DONE]" {
        return None;
    }
    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(data) {
        let status = envelope.error.code.unwrap_or(500);
        return Some(Err(classify_status(status, None, data)));
    }
    let payload: GenerateContentResponse = match serde_json::from_str(data) {
        Ok(payload) => payload,
        Err(e) => {
            return Some(Err(UpstreamFailure::new(
                FailureKind::Internal,
                format!("undecodable stream event: {e}"),
            )));
        }
    };
    if let Some(failure) = payload.policy_violation() {
        return Some(Err(failure));
    }
    let text = payload.text();
    (!text.is_empty()).then(|| Ok(StreamChunk::new(text)))
}

struct SseState<S> {
    body: S,
    decoder: SseDecoder,
    pending: VecDeque<TransportResult<StreamChunk>>,
    finished: bool,
}

/// Turn a raw SSE byte stream into a chunk stream.
///
/// The first error ends the stream.
fn sse_chunks<S, B>(body: S) -> ChunkStream
where
    S: Stream<Item = reqwest::Result<B>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let state = SseState {
        body: Box::pin(body),
        decoder: SseDecoder::default(),
        pending: VecDeque::new(),
        finished: false,
    };

    Box::pin(futures_util::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                if item.is_err() {
                    st.pending.clear();
                    st.finished = true;
                }
                return Some((item, st));
            }
            if st.finished {
                return None;
            }
            match st.body.next().await {
                Some(Ok(bytes)) => {
                    match st.decoder.push(bytes.as_ref()) {
                        Ok(events) => {
                            for data in events {
                                st.pending.extend(decode_event(&data));
                            }
                        }
                        Err(failure) => st.pending.push_back(Err(failure)),
                    }
                }
                Some(Err(e)) => {
                    st.finished = true;
                    st.pending.push_back(Err(classify_transport_error(e)));
                }
                None => {
                    st.finished = true;
                    if let Some(data) = st.decoder.finish() {
                        st.pending.extend(decode_event(&data));
                    }
                }
            }
        }
    }))
}
