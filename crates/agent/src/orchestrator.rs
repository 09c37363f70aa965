//! The driving state machine for one turn.
//!
//! ```text
//! START → DECIDE_TOOLS → {ANSWER_DIRECT | SELECT_TOOLS}
//! SELECT_TOOLS → EXECUTE → EVALUATE → {SYNTHESIZE | REFINE | ASK_USER}
//! REFINE → SELECT_TOOLS                (iteration + 1)
//! SYNTHESIZE | ANSWER_DIRECT | ASK_USER → DONE
//! ```
//!
//! Reaching the iteration bound on a failing evaluation always asks the
//! user; weak evidence is never synthesized over.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use beamline_llm::{ChatBackend, ChatMessage, ChatRequest, extract_json};
use beamline_tools::Dispatcher;
use beamline_tools::schema::validate_arguments;

use crate::context;
use crate::error::AgentError;
use crate::events::AgentEvent;
use crate::ledger::UsageLedger;
use crate::prompts::{self, STRICT_JSON_SUFFIX, TurnContext};
use crate::types::{
    EvaluationVerdict, ExecutionRecord, OutcomeKind, Plan, RejectedSelection, ToolSelection, Turn,
    TurnOutcome,
};

/// Bound on the refine loop.  Configurable per session, but never below 1.
pub const MAX_ITERATIONS: usize = 3;

/// Planner reply to the decide-tools call.
#[derive(Debug, Deserialize)]
struct DecideReply {
    needs_tools: bool,
    #[serde(default)]
    reasoning: String,
}

/// Planner reply to the select-tools call.
#[derive(Debug, Deserialize)]
struct SelectReply {
    #[serde(default)]
    tools: Vec<ToolSelection>,
}

pub struct AgentOrchestrator {
    llm: Arc<dyn ChatBackend>,
    dispatcher: Arc<Dispatcher>,
}

impl AgentOrchestrator {
    pub fn new(llm: Arc<dyn ChatBackend>, dispatcher: Arc<Dispatcher>) -> Self {
        Self { llm, dispatcher }
    }

    /// Run one turn to completion, streaming events to `events`.
    ///
    /// Cancellation is honored at every suspension point: the pending LLM
    /// or tool call is abandoned and a terminal `Canceled` event is
    /// emitted.  The turn owns all of its state; nothing leaks across
    /// turns except the shared registry and sessions.
    #[instrument(skip_all, fields(model = %turn.settings.model, query_len = turn.query.len()))]
    pub async fn run_turn(
        &self,
        turn: &Turn,
        events: mpsc::Sender<AgentEvent>,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome, AgentError> {
        match self.drive(turn, &events, &cancel).await {
            Ok(outcome) => Ok(outcome),
            Err(AgentError::Canceled) => {
                let _ = events.send(AgentEvent::Canceled).await;
                Ok(canceled_outcome())
            }
            Err(error) => {
                let _ = events.send(AgentEvent::Error(error.to_string())).await;
                Err(error)
            }
        }
    }

    async fn drive(
        &self,
        turn: &Turn,
        events: &mpsc::Sender<AgentEvent>,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, AgentError> {
        let registry = self.dispatcher.registry();
        if turn.settings.tools_enabled && registry.is_empty() {
            return Err(AgentError::EmptyRegistry);
        }

        let tools_summary = context::tools_summary(registry);
        let system = format!(
            "{}\n{}",
            context::system_context(Utc::now()),
            turn.settings
                .system_prompt_template
                .replace("{mcp_tools_list}", &tools_summary),
        );
        let ctx = TurnContext {
            system,
            conversation: context::conversation_context(
                &turn.history,
                turn.settings.max_history_messages,
            ),
            files: context::files_summary(&turn.files),
            tools_summary,
        };

        if !turn.settings.tools_enabled {
            return self
                .answer_direct(turn, &ctx, "tools disabled for this session", events, cancel)
                .await;
        }

        // ── DECIDE_TOOLS ─────────────────────────────────────────────────
        self.step_started(events, "decide_tools").await;
        let decide = self
            .llm_json::<DecideReply>(turn, &prompts::decide_prompt(&ctx, &turn.query), cancel)
            .await?;
        let (needs_tools, decide_reasoning) = match decide {
            Some(reply) => (reply.needs_tools, reply.reasoning),
            // Bias toward tools when the planner reply stays undecipherable.
            None => {
                warn!("decide reply unparseable twice, defaulting to needs_tools=true");
                (true, "defaulted after unparseable planner reply".to_string())
            }
        };
        self.step_finished(events, "decide_tools", &format!("needs_tools={needs_tools}"))
            .await;

        if !needs_tools {
            return self.answer_direct(turn, &ctx, &decide_reasoning, events, cancel).await;
        }

        // ── SELECT_TOOLS → EXECUTE → EVALUATE → {REFINE | ...} ──────────
        let tools_detailed = context::tools_detailed(registry);
        let mut ledger = UsageLedger::new();
        let mut plans: Vec<Plan> = Vec::new();
        let mut executions: Vec<ExecutionRecord> = Vec::new();
        let mut rejections: Vec<RejectedSelection> = Vec::new();
        let mut attempts: Vec<(String, String)> = Vec::new();
        let mut refinement: Option<String> = None;
        let mut iteration = 0usize;
        let max_iterations = turn.settings.max_iterations.max(1);

        loop {
            self.step_started(events, "select_tools").await;
            let select = self
                .llm_json::<SelectReply>(
                    turn,
                    &prompts::select_prompt(&ctx, &turn.query, &tools_detailed, refinement.as_deref()),
                    cancel,
                )
                .await?;
            let proposed = select.map(|reply| reply.tools).unwrap_or_default();

            let mut surviving: Vec<ToolSelection> = Vec::new();
            for selection in proposed {
                match registry.get(&selection.tool_name) {
                    None => rejections.push(RejectedSelection {
                        tool_name: selection.tool_name.clone(),
                        reason: "tool not present in the registry".to_string(),
                    }),
                    Some(descriptor) => {
                        if let Err(violation) =
                            validate_arguments(&selection.arguments, &descriptor.input_schema)
                        {
                            rejections.push(RejectedSelection {
                                tool_name: selection.tool_name.clone(),
                                reason: violation.to_string(),
                            });
                        } else if let Err(policy) =
                            ledger.admit(&selection.tool_name, &selection.arguments)
                        {
                            rejections.push(RejectedSelection {
                                tool_name: selection.tool_name.clone(),
                                reason: policy.to_string(),
                            });
                        } else {
                            surviving.push(selection);
                        }
                    }
                }
            }
            let plan_reasoning = if surviving.is_empty() {
                "no selection survived validation".to_string()
            } else {
                surviving
                    .iter()
                    .map(|s| s.reasoning.as_str())
                    .filter(|r| !r.is_empty())
                    .collect::<Vec<_>>()
                    .join("; ")
            };
            plans.push(Plan::tool_driven(plan_reasoning, surviving.clone()));
            self.step_finished(
                events,
                "select_tools",
                &format!("{} invocation(s), {} rejected", surviving.len(), rejections.len()),
            )
            .await;

            if !surviving.is_empty() {
                self.step_started(events, "execute").await;
                let records = self.execute(&surviving, events, cancel).await?;
                executions.extend(records);
                self.step_finished(events, "execute", &format!("{} result(s)", executions.len()))
                    .await;
            }

            self.step_started(events, "evaluate").await;
            let verdict = self.evaluate(turn, &executions, cancel).await?;
            self.step_finished(
                events,
                "evaluate",
                &format!("adequate={}", verdict.adequate),
            )
            .await;

            for selection in &surviving {
                attempts.push((selection.tool_name.clone(), verdict.reasoning.clone()));
            }
            if surviving.is_empty() {
                attempts.push(("(no valid invocation)".to_string(), verdict.reasoning.clone()));
            }

            if verdict.adequate {
                let answer = self.synthesize(turn, &ctx, &executions, events, cancel).await?;
                let references = prompts::collect_references(&executions);
                info!(iterations = iteration, references = references.len(), "turn synthesized");
                return Ok(TurnOutcome {
                    kind: OutcomeKind::Answered,
                    answer: Some(answer),
                    plans,
                    executions,
                    rejections,
                    references,
                    iterations: iteration,
                });
            }

            iteration += 1;
            if iteration >= max_iterations {
                // Out of budget on weak evidence: ask, don't guess.
                let message = prompts::clarification_message(&attempts);
                let _ = events
                    .send(AgentEvent::ClarificationPrompt(message.clone()))
                    .await;
                info!(iterations = iteration, "turn ended in clarification");
                return Ok(TurnOutcome {
                    kind: OutcomeKind::Clarification,
                    answer: Some(message),
                    plans,
                    executions,
                    rejections,
                    references: vec![],
                    iterations: iteration,
                });
            }
            refinement = verdict.refinement.clone();
            debug!(iteration, refinement = ?refinement, "refining");
        }
    }

    // ── States ───────────────────────────────────────────────────────────

    async fn execute(
        &self,
        selections: &[ToolSelection],
        events: &mpsc::Sender<AgentEvent>,
        cancel: &CancellationToken,
    ) -> Result<Vec<ExecutionRecord>, AgentError> {
        for selection in selections {
            self.step_started(events, &format!("tool:{}", selection.tool_name)).await;
        }

        // Calls run concurrently; join_all hands the results back in
        // submission order so the execution log stays deterministic.
        let futures: Vec<_> = selections
            .iter()
            .map(|selection| {
                let dispatcher = Arc::clone(&self.dispatcher);
                let name = selection.tool_name.clone();
                let arguments = selection.arguments.clone();
                async move {
                    let timestamp = Utc::now();
                    let outcome = dispatcher.call(&name, &arguments).await;
                    (name, arguments, timestamp, outcome)
                }
            })
            .collect();
        let results = guarded(cancel, join_all(futures)).await?;

        let mut records = Vec::with_capacity(results.len());
        for (name, arguments, timestamp, outcome) in results {
            let (result, error) = match outcome {
                Ok(value) => (Some(value), None),
                Err(transport) => {
                    warn!(tool = %name, error = %transport, "tool call failed");
                    (None, Some(transport.to_string()))
                }
            };
            let summary = match &error {
                Some(error) => format!("error: {error}"),
                None => "ok".to_string(),
            };
            self.step_finished(events, &format!("tool:{name}"), &summary).await;
            records.push(ExecutionRecord {
                tool_name: name,
                arguments,
                timestamp,
                result,
                error,
            });
        }
        Ok(records)
    }

    async fn evaluate(
        &self,
        turn: &Turn,
        executions: &[ExecutionRecord],
        cancel: &CancellationToken,
    ) -> Result<EvaluationVerdict, AgentError> {
        if executions.is_empty() {
            return Ok(EvaluationVerdict {
                adequate: false,
                reasoning: "no tool invocation produced a result".to_string(),
                refinement: Some("rephrase and retry".to_string()),
            });
        }
        let prompt =
            prompts::evaluate_prompt(&turn.query, &prompts::summarize_executions(executions));
        let verdict = match self.llm_json::<EvaluationVerdict>(turn, &prompt, cancel).await? {
            Some(mut verdict) => {
                // A failing verdict must carry a usable refinement.
                if !verdict.adequate
                    && verdict.refinement.as_deref().is_none_or(|r| r.trim().is_empty())
                {
                    verdict.refinement = Some("rephrase and retry".to_string());
                }
                verdict
            }
            None => EvaluationVerdict {
                adequate: false,
                reasoning: "evaluator reply unparseable".to_string(),
                refinement: Some("rephrase and retry".to_string()),
            },
        };
        Ok(verdict)
    }

    async fn synthesize(
        &self,
        turn: &Turn,
        ctx: &TurnContext,
        executions: &[ExecutionRecord],
        events: &mpsc::Sender<AgentEvent>,
        cancel: &CancellationToken,
    ) -> Result<String, AgentError> {
        self.step_started(events, "synthesize").await;
        let references = prompts::collect_references(executions);
        let images = prompts::collect_image_urls(executions);
        let prompt = prompts::synthesize_prompt(
            ctx,
            &turn.query,
            &prompts::tool_context(executions),
            &references,
            &images,
        );
        let answer = self.stream_answer(turn, &prompt, events, cancel).await?;
        self.step_finished(events, "synthesize", &format!("{} chars", answer.len())).await;
        Ok(answer)
    }

    async fn answer_direct(
        &self,
        turn: &Turn,
        ctx: &TurnContext,
        reasoning: &str,
        events: &mpsc::Sender<AgentEvent>,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, AgentError> {
        self.step_started(events, "answer_direct").await;
        let prompt = prompts::direct_prompt(ctx, &context::files_full(&turn.files), &turn.query);
        let answer = self.stream_answer(turn, &prompt, events, cancel).await?;
        self.step_finished(events, "answer_direct", &format!("{} chars", answer.len())).await;
        Ok(TurnOutcome {
            kind: OutcomeKind::AnsweredDirect,
            answer: Some(answer),
            plans: vec![Plan::direct(reasoning)],
            executions: vec![],
            rejections: vec![],
            references: vec![],
            iterations: 0,
        })
    }

    // ── LLM plumbing ─────────────────────────────────────────────────────

    /// One structured-output call: parse, then retry once with a stricter
    /// prompt.  `None` after both attempts lets the caller apply its safe
    /// default.  Service errors (already retried inside the client)
    /// propagate and terminate the turn.
    async fn llm_json<T: serde::de::DeserializeOwned>(
        &self,
        turn: &Turn,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<T>, AgentError> {
        let request = self.request(turn, prompt);
        let reply = guarded(cancel, self.llm.chat(&request)).await??;
        if let Some(parsed) = extract_json::<T>(&reply) {
            return Ok(Some(parsed));
        }
        warn!("structured reply unparseable, retrying with strict prompt");
        let strict = self.request(turn, &format!("{prompt}{STRICT_JSON_SUFFIX}"));
        let reply = guarded(cancel, self.llm.chat(&strict)).await??;
        Ok(extract_json::<T>(&reply))
    }

    async fn stream_answer(
        &self,
        turn: &Turn,
        prompt: &str,
        events: &mpsc::Sender<AgentEvent>,
        cancel: &CancellationToken,
    ) -> Result<String, AgentError> {
        let (tx, mut rx) = mpsc::channel::<String>(128);
        let sink = events.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(token) = rx.recv().await {
                if sink.send(AgentEvent::Token(token)).await.is_err() {
                    break;
                }
            }
        });

        let request = self.request(turn, prompt);
        let streamed = guarded(cancel, self.llm.chat_stream(&request, tx)).await;
        let _ = forwarder.await;
        Ok(streamed??)
    }

    fn request(&self, turn: &Turn, prompt: &str) -> ChatRequest {
        ChatRequest {
            model: turn.settings.model.clone(),
            messages: vec![ChatMessage::user(prompt)],
            temperature: turn.settings.temperature,
        }
    }

    async fn step_started(&self, events: &mpsc::Sender<AgentEvent>, name: &str) {
        let _ = events
            .send(AgentEvent::StepStarted { name: name.to_string() })
            .await;
    }

    async fn step_finished(&self, events: &mpsc::Sender<AgentEvent>, name: &str, summary: &str) {
        let _ = events
            .send(AgentEvent::StepFinished {
                name: name.to_string(),
                summary: summary.to_string(),
            })
            .await;
    }
}

/// Race a suspension point against the turn's cancel token.
async fn guarded<T>(
    cancel: &CancellationToken,
    future: impl Future<Output = T>,
) -> Result<T, AgentError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AgentError::Canceled),
        value = future => Ok(value),
    }
}

fn canceled_outcome() -> TurnOutcome {
    TurnOutcome {
        kind: OutcomeKind::Canceled,
        answer: None,
        plans: vec![],
        executions: vec![],
        rejections: vec![],
        references: vec![],
        iterations: 0,
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::{Value, json};

    use beamline_config::SessionSettings;
    use beamline_llm::LlmError;
    use beamline_tools::{ToolDescriptor, ToolServer, TransportError};

    // ── scripted backends ──────────────────────────────────────────────────

    struct ScriptedLlm {
        replies: Mutex<VecDeque<String>>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedLlm {
        fn new(replies: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.iter().map(ToString::to_string).collect()),
                prompts: Mutex::new(vec![]),
            })
        }

        fn prompt(&self, index: usize) -> String {
            self.prompts.lock().unwrap()[index].clone()
        }

        fn prompt_count(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ChatBackend for ScriptedLlm {
        async fn chat(&self, request: &ChatRequest) -> Result<String, LlmError> {
            self.prompts
                .lock()
                .unwrap()
                .push(request.messages.last().unwrap().content.clone());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| LlmError::Service("script exhausted".to_string()))
        }

        async fn chat_stream(
            &self,
            request: &ChatRequest,
            tx: mpsc::Sender<String>,
        ) -> Result<String, LlmError> {
            let reply = self.chat(request).await?;
            let _ = tx.send(reply.clone()).await;
            Ok(reply)
        }
    }

    #[derive(Default)]
    struct StubServer {
        calls: Arc<Mutex<Vec<(String, Value)>>>,
    }

    #[async_trait]
    impl ToolServer for StubServer {
        async fn initialize(&self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, TransportError> {
            Ok(vec![
                ToolDescriptor {
                    name: "search_elog".to_string(),
                    description: "Search the logbook".to_string(),
                    input_schema: json!({
                        "properties": {
                            "query": {"type": "string"},
                            "since": {"type": "string"},
                            "until": {"type": "string"},
                            "system": {"type": "string"},
                            "max_results": {"type": "integer"}
                        },
                        "required": []
                    }),
                    server_id: String::new(),
                },
                ToolDescriptor {
                    name: "search_accelerator_knowledge".to_string(),
                    description: "Search the knowledge graph".to_string(),
                    input_schema: json!({
                        "properties": {
                            "query": {"type": "string"},
                            "accelerator": {
                                "type": "string",
                                "enum": ["hipa", "proscan", "sls", "swissfel", "all"]
                            }
                        },
                        "required": ["query"]
                    }),
                    server_id: String::new(),
                },
            ])
        }

        async fn call_tool(&self, name: &str, arguments: &Value) -> Result<Value, TransportError> {
            self.calls
                .lock()
                .unwrap()
                .push((name.to_string(), arguments.clone()));
            match name {
                "search_elog" => Ok(json!({
                    "total_found": 7,
                    "hits": [
                        {"title": "Beam dump 14:02", "score": 2.4,
                         "url": "https://elog.test/Operation/8888"},
                        {"title": "Dump follow-up", "score": 1.1,
                         "url": "https://elog.test/Operation/8891"}
                    ]
                })),
                "search_accelerator_knowledge" => Ok(json!({
                    "results": [
                        {"title": "RF system overview", "url": "https://kb.test/articles/42"}
                    ]
                })),
                other => Err(TransportError::UnknownTool(other.to_string())),
            }
        }
    }

    async fn orchestrator_with(
        llm: Arc<ScriptedLlm>,
    ) -> (AgentOrchestrator, Arc<Mutex<Vec<(String, Value)>>>) {
        let calls = Arc::new(Mutex::new(vec![]));
        let mut dispatcher = Dispatcher::new();
        dispatcher.add_server("stub", Box::new(StubServer { calls: Arc::clone(&calls) }));
        dispatcher.bootstrap().await;
        (AgentOrchestrator::new(llm, Arc::new(dispatcher)), calls)
    }

    async fn run(
        orchestrator: &AgentOrchestrator,
        turn: &Turn,
    ) -> (TurnOutcome, Vec<AgentEvent>) {
        let (tx, mut rx) = mpsc::channel(256);
        let outcome = orchestrator
            .run_turn(turn, tx, CancellationToken::new())
            .await
            .unwrap();
        let mut events = vec![];
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        (outcome, events)
    }

    fn turn(query: &str) -> Turn {
        Turn::new(query, SessionSettings::default())
    }

    // ── scenario: general knowledge, no tools ──────────────────────────────

    #[tokio::test]
    async fn conversational_query_answers_directly() {
        let llm = ScriptedLlm::new(&[
            r#"{"needs_tools": false, "reasoning": "purely conversational"}"#,
            "Hello! I can search the logbook and the machine knowledge base for you.",
        ]);
        let (orchestrator, calls) = orchestrator_with(Arc::clone(&llm)).await;

        let (outcome, events) = run(&orchestrator, &turn("Hello, what can you do?")).await;

        assert_eq!(outcome.kind, OutcomeKind::AnsweredDirect);
        assert!(outcome.executions.is_empty());
        assert!(outcome.references.is_empty(), "direct answers carry no citations");
        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(outcome.plans.len(), 1);
        assert_eq!(outcome.plans[0].strategy, crate::types::PlanStrategy::Direct);
        assert!(events.iter().any(|e| matches!(e, AgentEvent::Token(_))));
    }

    // ── scenario: single-tool logbook search ───────────────────────────────

    #[tokio::test]
    async fn single_tool_search_synthesizes_with_citation() {
        let llm = ScriptedLlm::new(&[
            r#"{"needs_tools": true, "reasoning": "needs recent logbook data"}"#,
            r#"{"tools": [{"tool_name": "search_elog",
                "arguments": {"query": "beam dump", "since": "2025-10-08", "until": "2025-10-15"},
                "reasoning": "last week"}]}"#,
            r#"{"adequate": true, "reasoning": "seven relevant entries"}"#,
            "Seven dumps were logged, see [elog.test](https://elog.test/Operation/8888).",
        ]);
        let (orchestrator, calls) = orchestrator_with(Arc::clone(&llm)).await;

        let (outcome, _) = run(&orchestrator, &turn("beam dump events last week")).await;

        assert_eq!(outcome.kind, OutcomeKind::Answered);
        assert_eq!(calls.lock().unwrap().len(), 1);
        assert_eq!(calls.lock().unwrap()[0].1["since"], "2025-10-08");
        // Every citation must correspond to a URL present in the execution log.
        assert!(outcome.references.contains(&"https://elog.test/Operation/8888".to_string()));
        assert!(outcome.answer.unwrap().contains("/8888"));
        assert_eq!(outcome.iterations, 0);
    }

    // ── scenario: refinement via language switch ───────────────────────────

    #[tokio::test]
    async fn inadequate_evidence_refines_and_recovers() {
        let llm = ScriptedLlm::new(&[
            r#"{"needs_tools": true, "reasoning": "machine physics question"}"#,
            r#"{"tools": [{"tool_name": "search_accelerator_knowledge",
                "arguments": {"query": "Skew Quadrupole beam size", "accelerator": "sls"},
                "reasoning": "knowledge base"}]}"#,
            r#"{"adequate": false, "reasoning": "hits are off-topic",
                "refinement": "translate the query to German"}"#,
            r#"{"tools": [{"tool_name": "search_accelerator_knowledge",
                "arguments": {"query": "Skew Quadrupol Strahlgröße", "accelerator": "sls"},
                "reasoning": "German corpus"}]}"#,
            r#"{"adequate": true, "reasoning": "found the commissioning note"}"#,
            "Die Strahlgröße wird vom Skew-Quadrupol beeinflusst \
             ([kb.test](https://kb.test/articles/42)).",
        ]);
        let (orchestrator, calls) = orchestrator_with(Arc::clone(&llm)).await;

        let (outcome, _) = run(&orchestrator, &turn("Skew Quadrupole beam size at SLS")).await;

        assert_eq!(outcome.kind, OutcomeKind::Answered);
        assert_eq!(outcome.iterations, 1);
        assert_eq!(calls.lock().unwrap().len(), 2);
        // The refinement hint conditions the second select prompt.
        assert!(llm.prompt(3).contains("translate the query to German"));
        assert_eq!(outcome.plans.len(), 2);
    }

    // ── scenario: multi-tool plan in one execute step ──────────────────────

    #[tokio::test]
    async fn multi_tool_plan_runs_in_one_execute_step() {
        let llm = ScriptedLlm::new(&[
            r#"{"needs_tools": true, "reasoning": "two sources needed"}"#,
            r#"{"tools": [
                {"tool_name": "search_accelerator_knowledge",
                 "arguments": {"query": "SwissFEL RF system", "accelerator": "swissfel"},
                 "reasoning": "design"},
                {"tool_name": "search_elog",
                 "arguments": {"query": "RF", "system": "RF", "since": "2025-09-15"},
                 "reasoning": "recent problems"}
            ]}"#,
            r#"{"adequate": true, "reasoning": "both sources contribute"}"#,
            "The RF system ([kb.test](https://kb.test/articles/42)) had recent trips \
             ([elog.test](https://elog.test/Operation/8888)).",
        ]);
        let (orchestrator, calls) = orchestrator_with(Arc::clone(&llm)).await;

        let (outcome, _) = run(&orchestrator, &turn("Explain SwissFEL RF and recent problems")).await;

        assert_eq!(outcome.kind, OutcomeKind::Answered);
        assert_eq!(calls.lock().unwrap().len(), 2);
        // Execution log keeps submission order, not completion order.
        assert_eq!(outcome.executions[0].tool_name, "search_accelerator_knowledge");
        assert_eq!(outcome.executions[1].tool_name, "search_elog");
        // The reference list is URL-deduplicated across both results.
        assert_eq!(outcome.references.len(), 3);
        assert!(outcome.references.contains(&"https://kb.test/articles/42".to_string()));
    }

    // ── scenario: exhaustion ends in clarification ─────────────────────────

    #[tokio::test]
    async fn exhausted_iterations_ask_the_user() {
        let llm = ScriptedLlm::new(&[
            r#"{"needs_tools": true, "reasoning": "sounds technical"}"#,
            r#"{"tools": [{"tool_name": "search_elog",
                "arguments": {"query": "quantum multiverse"}, "reasoning": "try elog"}]}"#,
            r#"{"adequate": false, "reasoning": "nothing relevant",
                "refinement": "try the knowledge base"}"#,
            r#"{"tools": [{"tool_name": "search_accelerator_knowledge",
                "arguments": {"query": "quantum multiverse", "accelerator": "hipa"},
                "reasoning": "second try"}]}"#,
            r#"{"adequate": false, "reasoning": "still off-topic",
                "refinement": "broaden the query"}"#,
            r#"{"tools": [{"tool_name": "search_elog",
                "arguments": {"query": "multiverse fluctuations"}, "reasoning": "third try"}]}"#,
            r#"{"adequate": false, "reasoning": "no usable evidence"}"#,
        ]);
        let (orchestrator, _) = orchestrator_with(Arc::clone(&llm)).await;

        let (outcome, events) = run(
            &orchestrator,
            &turn("Quantum multiverse fluctuations in HIPA"),
        )
        .await;

        assert_eq!(outcome.kind, OutcomeKind::Clarification);
        assert_eq!(outcome.iterations, MAX_ITERATIONS);
        assert_eq!(outcome.plans.len(), 3);
        let message = outcome.answer.unwrap();
        assert!(message.contains("search_elog"));
        assert!(message.contains("search_accelerator_knowledge"));
        assert!(message.contains("no usable evidence"));
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::ClarificationPrompt(_))));
    }

    // ── scenario: duplicate-call policy ────────────────────────────────────

    #[tokio::test]
    async fn duplicate_invocations_run_exactly_once() {
        let duplicate = r#"{"tool_name": "search_elog",
            "arguments": {"query": "beam dump"}, "reasoning": "again"}"#;
        let select = format!(
            r#"{{"tools": [{duplicate}, {duplicate}, {duplicate}, {duplicate}]}}"#
        );
        let llm = ScriptedLlm::new(&[
            r#"{"needs_tools": true, "reasoning": "logbook"}"#,
            &select,
            r#"{"adequate": true, "reasoning": "one result is enough"}"#,
            "One dump event ([elog.test](https://elog.test/Operation/8888)).",
        ]);
        let (orchestrator, calls) = orchestrator_with(Arc::clone(&llm)).await;

        let (outcome, _) = run(&orchestrator, &turn("beam dump")).await;

        assert_eq!(calls.lock().unwrap().len(), 1, "duplicates never reach the transport");
        assert_eq!(outcome.rejections.len(), 3);
        assert!(outcome.rejections.iter().all(|r| r.reason.contains("duplicate")));
    }

    // ── boundary: tools disabled ───────────────────────────────────────────

    #[tokio::test]
    async fn tools_disabled_skips_the_whole_loop() {
        let llm = ScriptedLlm::new(&["Answered from general knowledge alone."]);
        let (orchestrator, calls) = orchestrator_with(Arc::clone(&llm)).await;

        let mut t = turn("What is a skew quadrupole?");
        t.settings.tools_enabled = false;
        let (outcome, _) = run(&orchestrator, &t).await;

        assert_eq!(outcome.kind, OutcomeKind::AnsweredDirect);
        assert_eq!(llm.prompt_count(), 1, "no decide/select/evaluate calls");
        assert!(calls.lock().unwrap().is_empty());
    }

    // ── boundary: malformed planner output ─────────────────────────────────

    #[tokio::test]
    async fn undecipherable_decide_defaults_to_tools() {
        let llm = ScriptedLlm::new(&[
            "I think you probably want tools for this one!",
            "still not json, sorry",
            r#"{"tools": [{"tool_name": "search_elog",
                "arguments": {"query": "beam current"}, "reasoning": "default path"}]}"#,
            r#"{"adequate": true, "reasoning": "fine"}"#,
            "Current was stable ([elog.test](https://elog.test/Operation/8888)).",
        ]);
        let (orchestrator, calls) = orchestrator_with(Arc::clone(&llm)).await;

        let (outcome, _) = run(&orchestrator, &turn("beam current today")).await;

        assert_eq!(outcome.kind, OutcomeKind::Answered);
        assert_eq!(calls.lock().unwrap().len(), 1);
        // The retry used the stricter prompt.
        assert!(llm.prompt(1).contains("ONLY one valid JSON object"));
    }

    // ── boundary: invalid selections are dropped with reasons ──────────────

    #[tokio::test]
    async fn invalid_selections_recorded_and_dropped() {
        let llm = ScriptedLlm::new(&[
            r#"{"needs_tools": true, "reasoning": "tools"}"#,
            r#"{"tools": [
                {"tool_name": "open_beam_shutter", "arguments": {}, "reasoning": "not a tool"},
                {"tool_name": "search_accelerator_knowledge",
                 "arguments": {"accelerator": "sls"}, "reasoning": "missing query"},
                {"tool_name": "search_accelerator_knowledge",
                 "arguments": {"query": "orbit feedback", "accelerator": "lep"},
                 "reasoning": "bad enum"},
                {"tool_name": "search_elog",
                 "arguments": {"query": "orbit feedback"}, "reasoning": "valid"}
            ]}"#,
            r#"{"adequate": true, "reasoning": "good"}"#,
            "Orbit feedback entries exist ([elog.test](https://elog.test/Operation/8888)).",
        ]);
        let (orchestrator, calls) = orchestrator_with(Arc::clone(&llm)).await;

        let (outcome, _) = run(&orchestrator, &turn("orbit feedback work")).await;

        assert_eq!(calls.lock().unwrap().len(), 1);
        assert_eq!(outcome.rejections.len(), 3);
        assert!(outcome.rejections[0].reason.contains("not present"));
        assert!(outcome.rejections[1].reason.contains("query"));
        assert!(outcome.rejections[2].reason.contains("allowed options"));
    }

    // ── fatal conditions ───────────────────────────────────────────────────

    #[tokio::test]
    async fn empty_registry_with_tools_enabled_is_fatal() {
        let llm = ScriptedLlm::new(&[]);
        let dispatcher = Dispatcher::new(); // nothing bootstrapped
        let orchestrator = AgentOrchestrator::new(llm, Arc::new(dispatcher));

        let (tx, _rx) = mpsc::channel(16);
        let err = orchestrator
            .run_turn(&turn("anything"), tx, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::EmptyRegistry));
    }

    #[tokio::test]
    async fn llm_service_failure_terminates_the_turn() {
        // Empty script: the first chat call fails as if the service died.
        let llm = ScriptedLlm::new(&[]);
        let (orchestrator, _) = orchestrator_with(Arc::clone(&llm)).await;

        let (tx, mut rx) = mpsc::channel(16);
        let err = orchestrator
            .run_turn(&turn("anything"), tx, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Llm(_)));
        let mut saw_error = false;
        while let Ok(event) = rx.try_recv() {
            saw_error |= matches!(event, AgentEvent::Error(_));
        }
        assert!(saw_error, "a user-visible error event is emitted");
    }

    // ── cancellation ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn cancellation_emits_terminal_event() {
        let llm = ScriptedLlm::new(&[
            r#"{"needs_tools": false, "reasoning": "conversational"}"#,
            "never streamed",
        ]);
        let (orchestrator, _) = orchestrator_with(Arc::clone(&llm)).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let (tx, mut rx) = mpsc::channel(16);
        let outcome = orchestrator
            .run_turn(&turn("hello"), tx, cancel)
            .await
            .unwrap();

        assert_eq!(outcome.kind, OutcomeKind::Canceled);
        assert!(outcome.answer.is_none());
        let mut saw_canceled = false;
        while let Ok(event) = rx.try_recv() {
            saw_canceled |= matches!(event, AgentEvent::Canceled);
        }
        assert!(saw_canceled);
    }
}
