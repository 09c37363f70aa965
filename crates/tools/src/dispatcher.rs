//! Session bootstrap and call routing.

use std::collections::HashMap;

use serde_json::Value;
use tracing::{info, warn};

use crate::transport::{ToolServer, TransportError};
use crate::ToolRegistry;

/// Owns the tool-server sessions and the registry built from them.
///
/// The registry's descriptors carry a stable server id; calls resolve the
/// session through this map, so the registry never holds a session handle.
#[derive(Default)]
pub struct Dispatcher {
    servers: HashMap<String, Box<dyn ToolServer>>,
    registry: ToolRegistry,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_server(&mut self, id: impl Into<String>, server: Box<dyn ToolServer>) {
        self.servers.insert(id.into(), server);
    }

    /// Initialize every server and merge its descriptors.  A failing
    /// server is reported unavailable and skipped; the session can still
    /// run on the remaining ones.
    pub async fn bootstrap(&mut self) {
        let mut ids: Vec<String> = self.servers.keys().cloned().collect();
        ids.sort();

        for id in ids {
            let server = &self.servers[&id];
            if let Err(error) = server.initialize().await {
                warn!(server = %id, %error, "tool server unavailable, skipping");
                continue;
            }
            match server.list_tools().await {
                Ok(descriptors) => {
                    info!(server = %id, tools = descriptors.len(), "tool server loaded");
                    self.registry.merge(&id, descriptors);
                }
                Err(error) => {
                    warn!(server = %id, %error, "tool listing failed, skipping");
                }
            }
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Route one call to the owning server.
    pub async fn call(&self, name: &str, arguments: &Value) -> Result<Value, TransportError> {
        let descriptor = self
            .registry
            .get(name)
            .ok_or_else(|| TransportError::UnknownTool(name.to_string()))?;
        let server = self
            .servers
            .get(&descriptor.server_id)
            .ok_or_else(|| TransportError::Unavailable(descriptor.server_id.clone()))?;
        server.call_tool(name, arguments).await
    }
}
