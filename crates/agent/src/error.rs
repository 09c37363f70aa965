use thiserror::Error;

use beamline_llm::LlmError;

#[derive(Debug, Error)]
pub enum AgentError {
    /// The LLM stayed unavailable after its retry; the turn terminates
    /// with a user-visible error.
    #[error(transparent)]
    Llm(#[from] LlmError),
    /// Misconfiguration: tools are enabled but the registry is empty.
    #[error("tools are enabled but no tool server provided any tools")]
    EmptyRegistry,
    #[error("turn canceled")]
    Canceled,
}
