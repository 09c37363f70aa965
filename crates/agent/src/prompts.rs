//! Prompt assembly for the four LLM calls of a turn.
//!
//! The context blocks are built once per turn (see [`crate::context`])
//! and threaded through the state machine; this module owns the prompt
//! layout and the grounding rules of the final synthesis.

use serde_json::Value;
use url::Url;

use crate::context::truncate;
use crate::types::ExecutionRecord;

/// Appended on the JSON-parse retry.
pub const STRICT_JSON_SUFFIX: &str =
    "\n\nIMPORTANT: respond with ONLY one valid JSON object. No prose, no code fences.";

/// Per-result body budget inside the synthesis prompt.
const RESULT_CHAR_BUDGET: usize = 2000;

/// Budget for one result line in the evaluation summary.
const SUMMARY_LINE_BUDGET: usize = 400;

/// Context blocks shared by the prompts of one turn.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub system: String,
    pub conversation: String,
    pub files: String,
    pub tools_summary: String,
}

pub fn decide_prompt(ctx: &TurnContext, query: &str) -> String {
    format!(
        "{system}\n\n\
         Decide whether answering the user's question requires querying external \
         tools. Default to requiring tools unless the question is clearly \
         conversational, purely about the prior conversation, or purely about the \
         uploaded files.\n\n\
         RECENT CONVERSATION:\n{conversation}\n\n\
         UPLOADED FILES:\n{files}\n\n\
         AVAILABLE TOOLS:\n{tools}\n\n\
         QUESTION:\n{query}\n\n\
         Respond with a JSON object: {{\"needs_tools\": bool, \"reasoning\": string}}",
        system = ctx.system,
        conversation = ctx.conversation,
        files = if ctx.files.is_empty() { "(none)" } else { &ctx.files },
        tools = ctx.tools_summary,
    )
}

pub fn select_prompt(
    ctx: &TurnContext,
    query: &str,
    tools_detailed: &str,
    refinement: Option<&str>,
) -> String {
    let refinement_block = match refinement {
        Some(hint) => format!(
            "\n\nA previous attempt was judged inadequate. Refinement to apply:\n{hint}\n"
        ),
        None => String::new(),
    };
    format!(
        "{system}\n\n\
         Select the tool invocations that will gather the evidence needed to \
         answer the question. Use precise arguments; prefer one well-aimed call \
         per source over many broad ones.\n\n\
         TOOLS (full schemas):\n{tools_detailed}\n\
         RECENT CONVERSATION:\n{conversation}\n\n\
         QUESTION:\n{query}{refinement_block}\n\n\
         Respond with a JSON object: {{\"tools\": [{{\"tool_name\": string, \
         \"arguments\": object, \"reasoning\": string}}]}}",
        system = ctx.system,
        conversation = ctx.conversation,
    )
}

pub fn evaluate_prompt(query: &str, results_summary: &str) -> String {
    format!(
        "You are judging retrieved evidence. The answer may only be synthesized \
         when at least one result is topically relevant AND detailed enough to \
         answer the question. Otherwise mark it inadequate and propose a concrete \
         refinement (e.g. switch source, translate the query, add a facility \
         filter, change retrieval mode).\n\n\
         QUESTION:\n{query}\n\n\
         TOOL RESULTS THIS TURN:\n{results_summary}\n\n\
         Respond with a JSON object: {{\"adequate\": bool, \"reasoning\": string, \
         \"refinement\": string or null}}"
    )
}

pub fn synthesize_prompt(
    ctx: &TurnContext,
    query: &str,
    tool_context: &str,
    references: &[String],
    images: &[String],
) -> String {
    let reference_block = if references.is_empty() {
        "(no references)".to_string()
    } else {
        references
            .iter()
            .map(|url| format!("- [{}]({url})", domain_of(url)))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let image_block = if images.is_empty() {
        String::new()
    } else {
        format!(
            "\n\nINLINE IMAGES (embed the relevant ones as ![caption](url)):\n{}",
            images.join("\n")
        )
    };
    format!(
        "{system}\n\n\
         Write the final answer.\n\
         - Be concise: 2 to 4 paragraphs.\n\
         - Every factual claim drawn from the tool results must cite one of the \
           listed references, linked by its domain name.\n\
         - Mathematics goes in $$...$$.\n\
         - Answer in the language of the user's question.\n\n\
         RECENT CONVERSATION:\n{conversation}\n\n\
         TOOL RESULTS:\n{tool_context}\n\n\
         REFERENCES (cite only these):\n{reference_block}{image_block}\n\n\
         QUESTION:\n{query}",
        system = ctx.system,
        conversation = ctx.conversation,
    )
}

pub fn direct_prompt(ctx: &TurnContext, files_full: &str, query: &str) -> String {
    format!(
        "{system}\n\n\
         Answer from the conversation, the uploaded files, and general knowledge. \
         No external tools were consulted; do not fabricate logbook citations.\n\n\
         RECENT CONVERSATION:\n{conversation}\n\n\
         UPLOADED FILES:\n{files}\n\n\
         QUESTION:\n{query}",
        system = ctx.system,
        conversation = ctx.conversation,
        files = if files_full.is_empty() { "(none)" } else { files_full },
    )
}

/// The clarification message sent when every iteration came back
/// inadequate.  `attempts` pairs each tried tool with the evaluator's
/// reasoning.
pub fn clarification_message(attempts: &[(String, String)]) -> String {
    let tried = if attempts.is_empty() {
        "- (no tool produced usable evidence)".to_string()
    } else {
        attempts
            .iter()
            .map(|(tool, reason)| format!("- {tool}: {reason}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    format!(
        "I could not find evidence solid enough to answer confidently. Here is \
         what I tried:\n{tried}\n\n\
         How would you like to continue?\n\
         1. Narrow the search (time range, facility, system, or category).\n\
         2. Have me answer from general accelerator knowledge, without facility data.\n\
         3. Point me somewhere else entirely."
    )
}

// ── Tool-result rendering ────────────────────────────────────────────────────

/// Compact per-result summary for the evaluator: hit counts, top titles,
/// and score ranges where the result shape exposes them.
pub fn summarize_executions(executions: &[ExecutionRecord]) -> String {
    if executions.is_empty() {
        return "(no tool results)".to_string();
    }
    executions
        .iter()
        .map(|record| {
            let header = format!("{}{}", record.tool_name, compact_args(&record.arguments));
            match (&record.result, &record.error) {
                (_, Some(error)) => format!("{header}: ERROR {error} (no result)"),
                (Some(result), None) => {
                    format!("{header}: {}", summarize_result(result))
                }
                (None, None) => format!("{header}: (empty result)"),
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn summarize_result(result: &Value) -> String {
    let hits = result.get("hits").and_then(Value::as_array);
    if let Some(hits) = hits {
        let total = result
            .get("total_found")
            .and_then(Value::as_u64)
            .unwrap_or(hits.len() as u64);
        let titles: Vec<&str> = hits
            .iter()
            .take(3)
            .filter_map(|hit| hit.get("title").and_then(Value::as_str))
            .collect();
        let scores: Vec<f64> = hits
            .iter()
            .filter_map(|hit| hit.get("score").and_then(Value::as_f64))
            .collect();
        let score_range = match (
            scores.iter().cloned().reduce(f64::min),
            scores.iter().cloned().reduce(f64::max),
        ) {
            (Some(min), Some(max)) => format!(", scores {min:.2}..{max:.2}"),
            _ => String::new(),
        };
        return format!(
            "{total} matches, top: {}{score_range}",
            if titles.is_empty() {
                "(untitled)".to_string()
            } else {
                titles.join(" | ")
            }
        );
    }
    truncate(&result.to_string(), SUMMARY_LINE_BUDGET)
}

fn compact_args(arguments: &Value) -> String {
    match arguments {
        Value::Object(map) if !map.is_empty() => {
            let rendered = truncate(&arguments.to_string(), 120);
            format!("({rendered})")
        }
        _ => String::new(),
    }
}

/// Full result bodies for the synthesis prompt, truncated per result.
pub fn tool_context(executions: &[ExecutionRecord]) -> String {
    executions
        .iter()
        .filter_map(|record| {
            let result = record.result.as_ref()?;
            Some(format!(
                "### {}\n{}",
                record.tool_name,
                truncate(&result.to_string(), RESULT_CHAR_BUDGET)
            ))
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Every `url` field in the execution log, deduplicated in first-seen
/// order.  The synthesis contract only allows citations drawn from here.
pub fn collect_references(executions: &[ExecutionRecord]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut references = Vec::new();
    for record in executions {
        if let Some(result) = &record.result {
            collect_urls(result, &mut |url| {
                if !is_image_url(url) && seen.insert(url.to_string()) {
                    references.push(url.to_string());
                }
            });
        }
    }
    references
}

/// Image URLs from the execution log, for inline embedding.
pub fn collect_image_urls(executions: &[ExecutionRecord]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut images = Vec::new();
    for record in executions {
        if let Some(result) = &record.result {
            collect_urls(result, &mut |url| {
                if is_image_url(url) && seen.insert(url.to_string()) {
                    images.push(url.to_string());
                }
            });
        }
    }
    images
}

fn collect_urls(value: &Value, visit: &mut impl FnMut(&str)) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if key == "url" {
                    if let Some(url) = child.as_str() {
                        visit(url);
                    }
                }
                collect_urls(child, visit);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_urls(item, visit);
            }
        }
        _ => {}
    }
}

fn is_image_url(url: &str) -> bool {
    let lower = url.to_lowercase();
    [".png", ".jpg", ".jpeg", ".gif", ".svg"]
        .iter()
        .any(|ext| lower.ends_with(ext))
}

fn domain_of(raw: &str) -> String {
    Url::parse(raw)
        .ok()
        .and_then(|url| url.host_str().map(ToString::to_string))
        .unwrap_or_else(|| raw.to_string())
}
