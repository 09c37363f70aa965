use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

// ── Tool descriptors and registry ────────────────────────────────────────────

/// Static metadata about a tool, used by the planner to decide which tool
/// to call and to validate its arguments before dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON-schema-like object: `properties`, `required`, per-property
    /// `type`/`enum`/`description`.
    pub input_schema: serde_json::Value,
    /// Owning server.  Sessions are looked up by this id, never embedded.
    #[serde(default)]
    pub server_id: String,
}

/// Registry of every tool the agent may invoke.  Built once at session
/// bootstrap and read-only afterwards.
#[derive(Debug, Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolDescriptor>,
}

impl ToolRegistry {
    /// Merge one server's descriptors.  On a name conflict the last-loaded
    /// descriptor wins; the shadowing is logged, not an error.
    pub fn merge(&mut self, server_id: &str, descriptors: Vec<ToolDescriptor>) {
        for mut descriptor in descriptors {
            descriptor.server_id = server_id.to_string();
            if let Some(previous) = self.tools.get(&descriptor.name) {
                warn!(
                    tool = %descriptor.name,
                    previous = %previous.server_id,
                    replacement = %server_id,
                    "tool name conflict, last-loaded wins"
                );
            }
            self.tools.insert(descriptor.name.clone(), descriptor);
        }
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Descriptors in stable name order, so prompt rendering is
    /// byte-identical across calls on an unchanged registry.
    pub fn descriptors(&self) -> Vec<&ToolDescriptor> {
        let mut all: Vec<&ToolDescriptor> = self.tools.values().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}

pub mod builtins;
pub mod dispatcher;
pub mod schema;
pub mod transport;

pub use dispatcher::Dispatcher;
pub use schema::{SchemaViolation, validate_arguments};
pub use transport::{SseToolServer, ToolServer, TransportError};

// ── Registry tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod registry_tests {
    use super::*;
    use serde_json::json;

    fn descriptor(name: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_string(),
            description: format!("tool {name}"),
            input_schema: json!({"type": "object", "properties": {}}),
            server_id: String::new(),
        }
    }

    #[test]
    fn empty_registry() {
        let registry = ToolRegistry::default();
        assert!(registry.is_empty());
        assert!(registry.get("anything").is_none());
    }

    #[test]
    fn merge_assigns_owning_server() {
        let mut registry = ToolRegistry::default();
        registry.merge("elog", vec![descriptor("search_elog")]);
        let entry = registry.get("search_elog").unwrap();
        assert_eq!(entry.server_id, "elog");
    }

    #[test]
    fn conflict_last_loaded_wins() {
        let mut registry = ToolRegistry::default();
        registry.merge("first", vec![descriptor("shared_tool")]);
        registry.merge("second", vec![descriptor("shared_tool")]);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("shared_tool").unwrap().server_id, "second");
    }

    #[test]
    fn descriptors_are_name_sorted() {
        let mut registry = ToolRegistry::default();
        registry.merge("s", vec![descriptor("zeta"), descriptor("alpha"), descriptor("mid")]);
        let names: Vec<&str> = registry.descriptors().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }
}
