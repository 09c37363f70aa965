use serde::{Deserialize, Serialize};

/// Control signals surfaced to the caller while a turn runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AgentEvent {
    /// One synthesis token, streamed as it arrives.
    Token(String),
    StepStarted { name: String },
    StepFinished { name: String, summary: String },
    /// The turn ended without synthesis; the user is asked to narrow or
    /// redirect the question.
    ClarificationPrompt(String),
    Canceled,
    Error(String),
}
