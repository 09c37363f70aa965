//! Logbook retrieval exposed as a tool server.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use beamline_elog::{ElogHit, ElogSearch, SearchParams, ThreadGraph};

use crate::transport::{ToolServer, TransportError};
use crate::ToolDescriptor;

/// Bounded attribute sets of the facility logbook.
pub const CATEGORIES: [&str; 5] = ["Info", "Problem", "Measurement", "Request", "Other"];
pub const SYSTEMS: [&str; 7] = [
    "RF",
    "Magnets",
    "Vacuum",
    "Diagnostics",
    "Controls",
    "Operation",
    "Safety",
];
pub const DOMAINS: [&str; 5] = ["HIPA", "PROSCAN", "SLS", "SwissFEL", "General"];

/// How much cleaned body text each hit contributes to a tool result.
const EXCERPT_CHARS: usize = 600;

pub struct ElogToolServer {
    search: Arc<ElogSearch>,
}

impl ElogToolServer {
    pub fn new(search: Arc<ElogSearch>) -> Self {
        Self { search }
    }

    async fn search_elog(&self, arguments: &Value) -> Result<Value, TransportError> {
        let text = |key: &str| {
            arguments
                .get(key)
                .and_then(Value::as_str)
                .map(ToString::to_string)
        };
        let params = SearchParams {
            query: text("query"),
            since: text("since"),
            until: text("until"),
            category: text("category"),
            system: text("system"),
            domain: text("domain"),
            max_results: arguments
                .get("max_results")
                .and_then(Value::as_u64)
                .unwrap_or(0) as usize,
        };

        let outcome = self
            .search
            .search(&params)
            .await
            .map_err(|e| TransportError::Call(e.to_string()))?;

        Ok(json!({
            "total_found": outcome.total_found,
            "hits": outcome.hits.iter().map(hit_json).collect::<Vec<_>>(),
            "aggregations": {
                "by_category": outcome.by_category,
                "by_system": outcome.by_system,
                "by_domain": outcome.by_domain,
            },
        }))
    }

    async fn get_elog_thread(&self, arguments: &Value) -> Result<Value, TransportError> {
        let message_id = arguments
            .get("message_id")
            .and_then(Value::as_u64)
            .ok_or_else(|| TransportError::Call("message_id is required".to_string()))?;
        let include_replies = arguments
            .get("include_replies")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let include_parents = arguments
            .get("include_parents")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        let graph = self
            .search
            .thread(message_id, include_replies, include_parents)
            .await
            .map_err(|e| TransportError::Call(e.to_string()))?;

        Ok(thread_json(&graph))
    }
}

fn hit_json(hit: &ElogHit) -> Value {
    let excerpt: String = hit.body_clean.chars().take(EXCERPT_CHARS).collect();
    json!({
        "id": hit.id,
        "date": hit.timestamp.map(|ts| ts.to_rfc3339()),
        "author": hit.author,
        "category": hit.category,
        "system": hit.system,
        "domain": hit.domain,
        "title": hit.title,
        "excerpt": excerpt,
        "url": hit.url,
        "attachments": hit.attachments,
        "score": hit.final_score,
    })
}

fn thread_json(graph: &ThreadGraph) -> Value {
    let entries: Vec<Value> = graph
        .preorder()
        .into_iter()
        .filter_map(|id| {
            let hit = graph.nodes.get(&id)?;
            let parent = graph
                .children
                .iter()
                .find(|(_, replies)| replies.contains(&id))
                .map(|(parent, _)| *parent);
            Some(json!({
                "id": id,
                "parent": parent,
                "title": hit.title,
                "date": hit.timestamp.map(|ts| ts.to_rfc3339()),
                "author": hit.author,
                "excerpt": hit.body_clean.chars().take(EXCERPT_CHARS).collect::<String>(),
                "url": hit.url,
            }))
        })
        .collect();

    json!({
        "root": graph.root,
        "queried": graph.queried,
        "entries": entries,
    })
}

#[async_trait]
impl ToolServer for ElogToolServer {
    async fn initialize(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, TransportError> {
        Ok(vec![
            ToolDescriptor {
                name: "search_elog".to_string(),
                description: "Search the facility electronic logbook. Supports keyword or \
                              regex queries (use `.*` for regex), date bounds, and filters \
                              by category, system, and domain."
                    .to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "query": {
                            "type": "string",
                            "description": "Keywords, or a regex when it contains `.*`"
                        },
                        "since": {
                            "type": "string",
                            "description": "Earliest entry date, YYYY-MM-DD"
                        },
                        "until": {
                            "type": "string",
                            "description": "Latest entry date, YYYY-MM-DD"
                        },
                        "category": {"type": "string", "enum": CATEGORIES},
                        "system": {"type": "string", "enum": SYSTEMS},
                        "domain": {"type": "string", "enum": DOMAINS},
                        "max_results": {
                            "type": "integer",
                            "description": "Number of entries to return (default 10)"
                        }
                    },
                    "required": []
                }),
                server_id: String::new(),
            },
            ToolDescriptor {
                name: "get_elog_thread".to_string(),
                description: "Fetch the reply thread around one logbook entry, optionally \
                              including its parents up to the thread root."
                    .to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "message_id": {"type": "integer", "description": "Logbook entry id"},
                        "include_replies": {"type": "boolean"},
                        "include_parents": {"type": "boolean"}
                    },
                    "required": ["message_id"]
                }),
                server_id: String::new(),
            },
        ])
    }

    async fn call_tool(&self, name: &str, arguments: &Value) -> Result<Value, TransportError> {
        match name {
            "search_elog" => self.search_elog(arguments).await,
            "get_elog_thread" => self.get_elog_thread(arguments).await,
            other => Err(TransportError::UnknownTool(other.to_string())),
        }
    }
}
