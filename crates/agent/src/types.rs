//! Turn-scoped data: the question, its context, the plan the model
//! produced, and the execution log the answer is grounded on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use beamline_config::SessionSettings;

/// One message of prior conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: String,
    pub content: String,
}

/// A file the user attached to the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadedFile {
    pub name: String,
    /// Extracted text; `None` for images.
    pub text: Option<String>,
}

impl UploadedFile {
    pub fn is_image(&self) -> bool {
        self.text.is_none()
    }
}

/// One user question within a session.  Created on submit, discarded when
/// the final answer is sent or the turn aborts.
#[derive(Debug, Clone)]
pub struct Turn {
    pub query: String,
    pub history: Vec<HistoryMessage>,
    pub files: Vec<UploadedFile>,
    pub settings: SessionSettings,
}

impl Turn {
    pub fn new(query: impl Into<String>, settings: SessionSettings) -> Self {
        Self {
            query: query.into(),
            history: vec![],
            files: vec![],
            settings,
        }
    }
}

// ── Plans ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStrategy {
    /// Answer without tools.
    Direct,
    /// One or more tool invocations, then evaluate and synthesize.
    MultiTool,
    /// No viable plan; the turn asks the user instead.
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
    ToolCall,
    Evaluate,
    Synthesize,
}

/// One tool invocation proposed by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSelection {
    pub tool_name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
    #[serde(default)]
    pub reasoning: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub step_id: u32,
    pub action: PlanAction,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invocations: Vec<ToolSelection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation_criteria: Option<String>,
    /// A step never runs before the step it depends on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<u32>,
}

/// The validated procedure executed for one iteration of a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub strategy: PlanStrategy,
    /// Model confidence in [0, 1].
    pub confidence: f64,
    pub reasoning: String,
    pub steps: Vec<PlanStep>,
}

impl Plan {
    pub fn direct(reasoning: impl Into<String>) -> Self {
        Self {
            strategy: PlanStrategy::Direct,
            confidence: 1.0,
            reasoning: reasoning.into(),
            steps: vec![PlanStep {
                step_id: 1,
                action: PlanAction::Synthesize,
                invocations: vec![],
                evaluation_criteria: None,
                depends_on: None,
            }],
        }
    }

    /// Standard tool-driven iteration: invoke, evaluate, synthesize.
    pub fn tool_driven(reasoning: impl Into<String>, invocations: Vec<ToolSelection>) -> Self {
        Self {
            strategy: PlanStrategy::MultiTool,
            confidence: 0.8,
            reasoning: reasoning.into(),
            steps: vec![
                PlanStep {
                    step_id: 1,
                    action: PlanAction::ToolCall,
                    invocations,
                    evaluation_criteria: None,
                    depends_on: None,
                },
                PlanStep {
                    step_id: 2,
                    action: PlanAction::Evaluate,
                    invocations: vec![],
                    evaluation_criteria: Some(
                        "results must be topically relevant and detailed enough to answer"
                            .to_string(),
                    ),
                    depends_on: Some(1),
                },
                PlanStep {
                    step_id: 3,
                    action: PlanAction::Synthesize,
                    invocations: vec![],
                    evaluation_criteria: None,
                    depends_on: Some(2),
                },
            ],
        }
    }
}

// ── Execution log ────────────────────────────────────────────────────────────

/// A tool invocation with its frozen arguments and outcome, appended to
/// the turn's execution log in submission order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionRecord {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// A proposed invocation that validation dropped, with the recorded
/// reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedSelection {
    pub tool_name: String,
    pub reason: String,
}

/// Verdict of the evaluate step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationVerdict {
    pub adequate: bool,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refinement: Option<String>,
}

// ── Turn outcome ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    /// Synthesized from tool evidence.
    Answered,
    /// Answered without tools.
    AnsweredDirect,
    /// Ended with a clarification request.
    Clarification,
    Canceled,
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub kind: OutcomeKind,
    /// Full answer text (also streamed token by token via events).
    pub answer: Option<String>,
    /// One plan per iteration, in order.
    pub plans: Vec<Plan>,
    pub executions: Vec<ExecutionRecord>,
    pub rejections: Vec<RejectedSelection>,
    /// Deduplicated reference URLs offered to the synthesis prompt.
    pub references: Vec<String>,
    /// Iterations consumed (0 when no refine loop ran).
    pub iterations: usize,
}
