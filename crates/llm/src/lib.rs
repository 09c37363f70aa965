//! Thin client for the remote chat endpoint.
//!
//! The orchestrator reaches the LLM engine through a single primitive:
//! `chat(model, messages)` either as one blocking call or as a stream of
//! token chunks.  The endpoint is OpenAI-compatible (`/chat/completions`);
//! everything provider-specific stays inside this crate.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Hard cap on non-streaming calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// A streaming call has no wall-clock cap, but a gap this long between
/// token chunks counts as a dead stream.
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(45);

// ── Chat message types ───────────────────────────────────────────────────────

/// Role in a chat conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// A single message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: content.into() }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into() }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: content.into() }
    }
}

/// One fully specified chat call.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
}

#[derive(Debug, Error)]
pub enum LlmError {
    /// The service stayed unreachable or kept returning errors after the
    /// internal retry.
    #[error("LLM service error: {0}")]
    Service(String),
    /// Request exceeded its wall-clock or idle budget.
    #[error("LLM call timed out: {0}")]
    Timeout(String),
    /// A JSON step stayed malformed after its stricter-prompt retry.
    /// Raised by callers that expect structured output, not by this client.
    #[error("LLM reply not parseable: {0}")]
    Parse(String),
}

/// The seam the orchestrator talks through.  The production implementation
/// is [`LlmClient`]; tests substitute scripted backends.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Full-response call.  Returns the assistant's text.
    async fn chat(&self, request: &ChatRequest) -> Result<String, LlmError>;

    /// Streaming call.  Token chunks are forwarded over `tx` as they
    /// arrive; the accumulated text is returned at the end.
    async fn chat_stream(
        &self,
        request: &ChatRequest,
        tx: mpsc::Sender<String>,
    ) -> Result<String, LlmError>;
}

// ── Production client ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LlmClient {
    client: reqwest::Client,
    base_url: String,
    api_key_env: String,
}

impl LlmClient {
    pub fn new(base_url: impl Into<String>, api_key_env: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
            api_key_env: api_key_env.into(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    /// Key is read per request so a rotated key is picked up live.
    fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
    }

    fn payload(&self, request: &ChatRequest, stream: bool) -> serde_json::Value {
        json!({
            "model": request.model,
            "messages": request.messages,
            "temperature": request.temperature,
            "stream": stream,
        })
    }

    async fn send(
        &self,
        payload: &serde_json::Value,
    ) -> Result<reqwest::Response, LlmError> {
        let mut builder = self.client.post(self.endpoint()).json(payload);
        if let Some(key) = self.api_key() {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout(e.to_string())
            } else {
                LlmError::Service(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(LlmError::Service(format!("upstream status {status}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Service(format!("status {status}: {body}")));
        }
        Ok(response)
    }

    /// Send with one internal retry on transport/5xx failure.  A second
    /// failure is surfaced to the caller (which terminates the turn).
    async fn send_with_retry(
        &self,
        payload: &serde_json::Value,
    ) -> Result<reqwest::Response, LlmError> {
        match self.send(payload).await {
            Ok(response) => Ok(response),
            Err(first) => {
                warn!(error = %first, "LLM request failed, retrying once");
                self.send(payload).await
            }
        }
    }
}

#[async_trait]
impl ChatBackend for LlmClient {
    async fn chat(&self, request: &ChatRequest) -> Result<String, LlmError> {
        let payload = self.payload(request, false);
        let response = self.send_with_retry(&payload).await?;
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::Service(e.to_string()))?;

        body.get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(|content| content.as_str())
            .map(ToString::to_string)
            .ok_or_else(|| LlmError::Service(format!("response missing content: {body}")))
    }

    async fn chat_stream(
        &self,
        request: &ChatRequest,
        tx: mpsc::Sender<String>,
    ) -> Result<String, LlmError> {
        let payload = self.payload(request, true);
        let mut response = self.send_with_retry(&payload).await?;

        let mut full_response = String::new();
        // Carry partial lines across chunk boundaries so a `data:` frame
        // split mid-line still parses.
        let mut carry = String::new();

        loop {
            let chunk = tokio::time::timeout(STREAM_IDLE_TIMEOUT, response.chunk())
                .await
                .map_err(|_| {
                    LlmError::Timeout(format!(
                        "no token for {}s on stream",
                        STREAM_IDLE_TIMEOUT.as_secs()
                    ))
                })?
                .map_err(|e| LlmError::Service(e.to_string()))?;

            let Some(chunk) = chunk else { break };
            carry.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(newline) = carry.find('\n') {
                let line: String = carry.drain(..=newline).collect();
                let line = line.trim();
                if line.is_empty() || line == "data: [DONE]" {
                    continue;
                }
                let Some(data) = line.strip_prefix("data: ") else { continue };
                let Ok(json) = serde_json::from_str::<serde_json::Value>(data) else {
                    continue;
                };
                if let Some(content) = json
                    .get("choices")
                    .and_then(|choices| choices.get(0))
                    .and_then(|choice| choice.get("delta"))
                    .and_then(|delta| delta.get("content"))
                    .and_then(|content| content.as_str())
                {
                    if content.is_empty() {
                        continue;
                    }
                    full_response.push_str(content);
                    let _ = tx.send(content.to_string()).await;
                }
            }
        }

        debug!(chars = full_response.len(), "stream complete");
        Ok(full_response)
    }
}

// ── Structured output extraction ─────────────────────────────────────────────

/// Extract a JSON value of type `T` from an LLM reply.
///
/// Planner and evaluator calls instruct the model to answer with a single
/// JSON object, but models wrap it in prose or fences anyway.  Fenced
/// regions are tried first, since a fenced copy is the one the model
/// meant as its answer; after that the whole reply is scanned.  In both
/// cases every balanced `{...}` span is tried independently, so a reply
/// carrying several objects still yields the one that matches `T`.
pub fn extract_json<T: serde::de::DeserializeOwned>(response: &str) -> Option<T> {
    for region in fenced_regions(response) {
        if let Some(value) = first_matching_object(region) {
            return Some(value);
        }
    }
    first_matching_object(response)
}

/// Bodies of ``` code fences, info string (`json` or none) stripped.
fn fenced_regions(text: &str) -> Vec<&str> {
    let mut regions = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("```") {
        let after = &rest[open + 3..];
        let body = match after.find('\n') {
            Some(newline) => &after[newline + 1..],
            None => after,
        };
        let Some(close) = body.find("```") else { break };
        regions.push(&body[..close]);
        rest = &body[close + 3..];
    }
    regions
}

/// First balanced object span that deserializes into `T`.
fn first_matching_object<T: serde::de::DeserializeOwned>(text: &str) -> Option<T> {
    let bytes = text.as_bytes();
    let mut at = 0;
    while at < bytes.len() {
        if bytes[at] != b'{' {
            at += 1;
            continue;
        }
        if let Some(len) = object_span(&text[at..]) {
            if let Ok(value) = serde_json::from_str(&text[at..at + len]) {
                return Some(value);
            }
        }
        // A span that fails to parse (or never closes) may still hold a
        // matching object nested inside it.
        at += 1;
    }
    None
}

/// Byte length of the balanced `{...}` span at the start of `text`.
/// Brace depth is tracked outside string literals only, with `\"` escapes
/// honored, so braces inside argument values do not end the span early.
fn object_span(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, byte) in text.bytes().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(offset + 1);
                }
            }
            _ => {}
        }
    }
    None
}

// ── Tests ────────────────────────────────────────────────────────────────────
