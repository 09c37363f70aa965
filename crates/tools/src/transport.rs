//! Sessions to remote tool servers over a server-sent-event transport.
//!
//! A session is opened lazily, reused across turns, and reopened with
//! exponential backoff after a transport error.  Each call sends one JSON
//! request frame and awaits exactly one response event.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::ToolDescriptor;

/// Per-call budget.  Exceeding it is indistinguishable from a failed call.
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Reconnect schedule; after the last attempt the server is reported
/// unavailable.
const RECONNECT_BACKOFF: [Duration; 3] = [
    Duration::from_millis(100),
    Duration::from_millis(400),
    Duration::from_millis(1600),
];

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("tool server unavailable: {0}")]
    Unavailable(String),
    #[error("tool call failed: {0}")]
    Call(String),
    #[error("tool call timed out after {0}s")]
    Timeout(u64),
    #[error("no such tool: {0}")]
    UnknownTool(String),
}

/// One tool server, remote or in-process.
#[async_trait]
pub trait ToolServer: Send + Sync {
    async fn initialize(&self) -> Result<(), TransportError>;

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, TransportError>;

    async fn call_tool(&self, name: &str, arguments: &Value) -> Result<Value, TransportError>;
}

// ── SSE-backed remote server ─────────────────────────────────────────────────

pub struct SseToolServer {
    client: reqwest::Client,
    url: String,
    /// Session token issued by `initialize`; `None` means the next use
    /// must reconnect.
    session: Mutex<Option<String>>,
}

impl SseToolServer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            session: Mutex::new(None),
        }
    }

    /// Send one request frame and await its single response event.
    async fn request(&self, payload: &Value) -> Result<Value, TransportError> {
        let response = self
            .client
            .post(&self.url)
            .header("Accept", "text/event-stream")
            .json(payload)
            .send()
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Unavailable(format!("status {status}")));
        }

        read_single_event(response).await
    }

    /// Open a session, retrying on the backoff schedule.  Gives up after
    /// the third failure and reports the server unavailable.
    async fn connect(&self) -> Result<String, TransportError> {
        let mut last = TransportError::Unavailable("no attempt made".to_string());
        for (attempt, backoff) in RECONNECT_BACKOFF.iter().enumerate() {
            match self.request(&json!({"method": "initialize"})).await {
                Ok(event) => {
                    let session = event
                        .get("session")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    debug!(url = %self.url, "tool server session opened");
                    return Ok(session);
                }
                Err(error) => {
                    warn!(url = %self.url, attempt, %error, "tool server connect failed");
                    last = error;
                    tokio::time::sleep(*backoff).await;
                }
            }
        }
        Err(last)
    }

    async fn ensure_session(&self) -> Result<String, TransportError> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            return Ok(session.clone());
        }
        let session = self.connect().await?;
        *guard = Some(session.clone());
        Ok(session)
    }

    async fn drop_session(&self) {
        *self.session.lock().await = None;
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        let session = self.ensure_session().await?;
        let payload = json!({"method": method, "params": params, "session": session});

        let outcome = tokio::time::timeout(CALL_TIMEOUT, self.request(&payload))
            .await
            .map_err(|_| TransportError::Timeout(CALL_TIMEOUT.as_secs()))?;

        match outcome {
            Ok(event) => {
                if let Some(error) = event.get("error") {
                    return Err(TransportError::Call(error.to_string()));
                }
                Ok(event.get("result").cloned().unwrap_or(Value::Null))
            }
            Err(error) => {
                // Lazy reconnect: the next use reopens the session.
                self.drop_session().await;
                Err(error)
            }
        }
    }
}

#[async_trait]
impl ToolServer for SseToolServer {
    async fn initialize(&self) -> Result<(), TransportError> {
        self.ensure_session().await.map(|_| ())
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, TransportError> {
        let result = self.call("list_tools", json!({})).await?;
        let tools = result
            .get("tools")
            .or(Some(&result))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        tools
            .into_iter()
            .map(|tool| {
                serde_json::from_value::<ToolDescriptor>(tool)
                    .map_err(|e| TransportError::Call(format!("bad descriptor: {e}")))
            })
            .collect()
    }

    async fn call_tool(&self, name: &str, arguments: &Value) -> Result<Value, TransportError> {
        self.call(
            "call_tool",
            json!({"name": name, "arguments": arguments}),
        )
        .await
    }
}

/// Read `data:` lines off the event stream until one complete JSON event
/// arrives.  Frames may split across chunks, so partial lines carry over.
async fn read_single_event(mut response: reqwest::Response) -> Result<Value, TransportError> {
    let mut carry = String::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| TransportError::Call(e.to_string()))?
    {
        carry.push_str(&String::from_utf8_lossy(&chunk));
        while let Some(newline) = carry.find('\n') {
            let line: String = carry.drain(..=newline).collect();
            let line = line.trim();
            let Some(data) = line.strip_prefix("data: ") else { continue };
            if let Ok(event) = serde_json::from_str::<Value>(data) {
                return Ok(event);
            }
        }
    }
    Err(TransportError::Call("stream ended without a response event".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn session_starts_empty_and_is_clearable() {
        let server = SseToolServer::new("http://tools.local/sse");
        assert!(server.session.lock().await.is_none());
        *server.session.lock().await = Some("s-1".to_string());
        server.drop_session().await;
        assert!(server.session.lock().await.is_none());
    }

    #[test]
    fn backoff_schedule_matches_policy() {
        assert_eq!(
            RECONNECT_BACKOFF.map(|d| d.as_millis()),
            [100, 400, 1600]
        );
        assert_eq!(CALL_TIMEOUT.as_secs(), 30);
    }
}
