use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of the OpenAI-compatible chat endpoint.
    pub base_url: String,
    /// Environment variable holding the bearer key.  Read at request time
    /// so rotated keys are picked up without a restart.
    pub api_key_env: String,
    pub model: String,
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/v1".to_string(),
            api_key_env: "BEAMLINE_LLM_API_KEY".to_string(),
            model: "qwen2.5-72b-instruct".to_string(),
            temperature: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    /// Base system prompt.  The placeholder `{mcp_tools_list}` is replaced
    /// with the registry's one-line tool summary at turn start.
    pub system_prompt_template: String,
    pub tools_enabled: bool,
    /// Bounded refine loop.  Must stay >= 1; `load_from` clamps.
    pub max_iterations: usize,
    pub max_history_messages: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "Beamline".to_string(),
            system_prompt_template: "You are the retrieval assistant for the accelerator \
                                     facility. Available tools:\n{mcp_tools_list}"
                .to_string(),
            tools_enabled: true,
            max_iterations: 3,
            max_history_messages: 6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElogConfig {
    pub base_url: String,
    pub logbook: String,
    pub timeout_secs: u64,
}

impl Default for ElogConfig {
    fn default() -> Self {
        Self {
            base_url: "https://elog.example.org".to_string(),
            logbook: "Operation".to_string(),
            timeout_secs: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub base_url: String,
    pub default_accelerator: String,
    pub default_retriever: String,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9200".to_string(),
            default_accelerator: "all".to_string(),
            default_retriever: "hybrid".to_string(),
        }
    }
}

/// One remote tool server reachable over the streaming-event transport.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolServerEntry {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ToolsConfig {
    pub servers: Vec<ToolServerEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub agent: AgentConfig,
    pub elog: ElogConfig,
    pub graph: GraphConfig,
    pub tools: ToolsConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    /// A missing file is not an error; the defaults apply.  Environment
    /// overrides win over the file so deployments can repoint endpoints
    /// without editing it.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = match fs::read_to_string(path) {
            Ok(raw) => toml::from_str(&raw)
                .with_context(|| format!("parse config {}", path.display()))?,
            Err(_) => Self::default(),
        };

        for (var, slot) in [
            ("BEAMLINE_LLM_BASE_URL", &mut config.llm.base_url),
            ("BEAMLINE_ELOG_BASE_URL", &mut config.elog.base_url),
        ] {
            match env::var(var) {
                Ok(value) if !value.is_empty() => *slot = value,
                _ => {}
            }
        }

        config.agent.max_iterations = config.agent.max_iterations.max(1);
        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let rendered = toml::to_string_pretty(self).context("render config as TOML")?;

        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create config directory {}", parent.display()))?;
            }
            _ => {}
        }
        fs::write(path, rendered).with_context(|| format!("write config to {}", path.display()))
    }

    /// Session settings seeded from the app defaults.
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            model: self.llm.model.clone(),
            temperature: self.llm.temperature,
            system_prompt_template: self.agent.system_prompt_template.clone(),
            tools_enabled: self.agent.tools_enabled,
            max_iterations: self.agent.max_iterations.max(1),
            max_history_messages: self.agent.max_history_messages,
        }
    }
}

/// Turn-scoped settings.  Derived from [`AppConfig`] and optionally
/// overridden per turn by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    pub model: String,
    pub temperature: f32,
    pub system_prompt_template: String,
    pub tools_enabled: bool,
    pub max_iterations: usize,
    pub max_history_messages: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        AppConfig::default().session_settings()
    }
}
