//! Knowledge-graph retrieval adapter.
//!
//! Interface-level only: requests are forwarded to the graph service and
//! its JSON comes back unchanged, so the agent consumes it exactly like
//! the logbook core.  The one piece of logic that lives here is input
//! normalization.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use crate::transport::{ToolServer, TransportError};
use crate::ToolDescriptor;

pub const ACCELERATORS: [&str; 5] = ["hipa", "proscan", "sls", "swissfel", "all"];
pub const RETRIEVERS: [&str; 3] = ["dense", "sparse", "hybrid"];

/// Relationship traversal is capped server-side as well; this mirrors it.
pub const MAX_TRAVERSAL_DEPTH: u64 = 5;

pub struct GraphToolServer {
    client: reqwest::Client,
    base_url: String,
}

impl GraphToolServer {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .user_agent("beamline/0.1")
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    fn url(&self, tail: &str) -> String {
        format!("{}/{tail}", self.base_url.trim_end_matches('/'))
    }

    async fn forward(&self, request: reqwest::RequestBuilder) -> Result<Value, TransportError> {
        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Call(format!("graph service status {status}")));
        }
        response
            .json()
            .await
            .map_err(|e| TransportError::Call(e.to_string()))
    }

    async fn search_knowledge(&self, arguments: &Value) -> Result<Value, TransportError> {
        let query = arguments
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| TransportError::Call("query is required".to_string()))?;
        let accelerator = arguments
            .get("accelerator")
            .and_then(Value::as_str)
            .unwrap_or("all")
            .to_lowercase();
        let retriever = normalize_retriever(
            arguments
                .get("retriever")
                .and_then(Value::as_str)
                .unwrap_or("hybrid"),
        );
        let limit = arguments.get("limit").and_then(Value::as_u64).unwrap_or(10);

        debug!(%accelerator, %retriever, limit, "knowledge-graph search");
        self.forward(self.client.post(self.url("search")).json(&json!({
            "query": query,
            "accelerator": accelerator,
            "retriever": retriever,
            "limit": limit,
        })))
        .await
    }

    async fn related_content(&self, arguments: &Value) -> Result<Value, TransportError> {
        let article_id = arguments
            .get("article_id")
            .and_then(Value::as_str)
            .ok_or_else(|| TransportError::Call("article_id is required".to_string()))?;
        let max_depth = arguments
            .get("max_depth")
            .and_then(Value::as_u64)
            .unwrap_or(1)
            .min(MAX_TRAVERSAL_DEPTH);

        self.forward(
            self.client
                .get(self.url(&format!("related/{article_id}")))
                .query(&[("max_depth", max_depth.to_string())]),
        )
        .await
    }
}

/// The retriever mode appears in two spellings across clients; the legacy
/// `both` means fused retrieval and maps to `hybrid`.
pub fn normalize_retriever(raw: &str) -> String {
    let lower = raw.trim().to_lowercase();
    match lower.as_str() {
        "both" | "hybrid" | "" => "hybrid".to_string(),
        "dense" | "sparse" => lower,
        _ => "hybrid".to_string(),
    }
}

#[async_trait]
impl ToolServer for GraphToolServer {
    async fn initialize(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, TransportError> {
        Ok(vec![
            ToolDescriptor {
                name: "search_accelerator_knowledge".to_string(),
                description: "Semantic search over the accelerator knowledge graph: \
                              design notes, commissioning reports, and machine physics \
                              articles for every facility."
                    .to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "query": {"type": "string", "description": "Search query"},
                        "accelerator": {"type": "string", "enum": ACCELERATORS},
                        "retriever": {
                            "type": "string",
                            "enum": RETRIEVERS,
                            "description": "Retrieval mode; fused retrieval is `hybrid`"
                        },
                        "limit": {"type": "integer", "description": "Result count (default 10)"}
                    },
                    "required": ["query"]
                }),
                server_id: String::new(),
            },
            ToolDescriptor {
                name: "get_related_content".to_string(),
                description: "Walk relationships from one knowledge-graph article and \
                              return the connected content."
                    .to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "article_id": {"type": "string"},
                        "max_depth": {
                            "type": "integer",
                            "description": "Traversal depth, capped at 5"
                        }
                    },
                    "required": ["article_id"]
                }),
                server_id: String::new(),
            },
        ])
    }

    async fn call_tool(&self, name: &str, arguments: &Value) -> Result<Value, TransportError> {
        match name {
            "search_accelerator_knowledge" => self.search_knowledge(arguments).await,
            "get_related_content" => self.related_content(arguments).await,
            other => Err(TransportError::UnknownTool(other.to_string())),
        }
    }
}
