//! Planner/executor state machine for one user turn.
//!
//! Each turn moves through decide-tools → select-tools → execute →
//! evaluate, refining up to a bounded number of iterations, and ends in a
//! streamed synthesis, a direct answer, or a clarification request.

pub mod context;
mod error;
mod events;
mod ledger;
mod orchestrator;
mod prompts;
mod types;

pub use error::AgentError;
pub use events::AgentEvent;
pub use ledger::{LedgerRejection, UsageLedger, MAX_CALLS_PER_TOOL, MAX_TOTAL_CALLS};
pub use orchestrator::{AgentOrchestrator, MAX_ITERATIONS};
pub use types::{
    EvaluationVerdict, ExecutionRecord, HistoryMessage, OutcomeKind, Plan, PlanAction, PlanStep,
    PlanStrategy, RejectedSelection, ToolSelection, Turn, TurnOutcome, UploadedFile,
};
