//! Pure context builders for the prompts fed to the LLM.
//!
//! Every builder is a function of its inputs alone, so the same registry
//! and history render byte-identically and prompt composition stays
//! deterministic across a turn.

use chrono::{DateTime, Utc};
use serde_json::Value;

use beamline_tools::ToolRegistry;

use crate::types::{HistoryMessage, UploadedFile};

/// Per-message budget in the conversation block.
const HISTORY_CHAR_BUDGET: usize = 200;

/// Preview budget for file summaries and the one-line tool list.
const SUMMARY_CHAR_BUDGET: usize = 100;

/// Enum options shown per parameter in the detailed tool listing.
const ENUM_OPTIONS_SHOWN: usize = 5;

/// Current weekday, date, time, and the assistant's role.
pub fn system_context(now: DateTime<Utc>) -> String {
    format!(
        "Today is {}. You are the retrieval assistant of a particle-accelerator \
         facility; you ground answers in the electronic logbook and the machine \
         knowledge base.",
        now.format("%A, %Y-%m-%d %H:%M UTC")
    )
}

/// The last `n` messages, each truncated to 200 characters.
pub fn conversation_context(history: &[HistoryMessage], n: usize) -> String {
    let start = history.len().saturating_sub(n);
    let lines: Vec<String> = history[start..]
        .iter()
        .map(|message| {
            format!(
                "{}: {}",
                message.role,
                truncate(&message.content, HISTORY_CHAR_BUDGET)
            )
        })
        .collect();
    if lines.is_empty() {
        "(no prior conversation)".to_string()
    } else {
        lines.join("\n")
    }
}

/// Per-file name plus a 100-character preview, or an image marker.
pub fn files_summary(files: &[UploadedFile]) -> String {
    files
        .iter()
        .map(|file| {
            if file.is_image() {
                format!("- {}: image uploaded", file.name)
            } else {
                let text = file.text.as_deref().unwrap_or_default();
                format!("- {}: {}", file.name, truncate(text, SUMMARY_CHAR_BUDGET))
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Per-file name and full extracted text.  Unbounded; the caller owns the
/// token budget.
pub fn files_full(files: &[UploadedFile]) -> String {
    files
        .iter()
        .map(|file| match &file.text {
            Some(text) => format!("=== {} ===\n{text}", file.name),
            None => format!("=== {} ===\n(image uploaded)", file.name),
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// One line per tool: `- name: description` with the description cut to
/// 100 characters.
pub fn tools_summary(registry: &ToolRegistry) -> String {
    registry
        .descriptors()
        .iter()
        .map(|tool| {
            format!(
                "- {}: {}",
                tool.name,
                truncate(&tool.description, SUMMARY_CHAR_BUDGET)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Full schemas: every parameter with type, enum options, and required
/// marker, one parameter per line.
pub fn tools_detailed(registry: &ToolRegistry) -> String {
    registry
        .descriptors()
        .iter()
        .map(|tool| {
            let mut block = format!("{}: {}\n", tool.name, tool.description);
            let required: Vec<&str> = tool
                .input_schema
                .get("required")
                .and_then(Value::as_array)
                .map(|names| names.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();

            if let Some(properties) = tool.input_schema.get("properties").and_then(Value::as_object)
            {
                let mut names: Vec<&String> = properties.keys().collect();
                names.sort();
                for name in names {
                    let spec = &properties[name];
                    let kind = spec.get("type").and_then(Value::as_str).unwrap_or("any");
                    let mut line = format!("  - {name} ({kind})");
                    if let Some(options) = spec.get("enum").and_then(Value::as_array) {
                        let shown: Vec<String> = options
                            .iter()
                            .take(ENUM_OPTIONS_SHOWN)
                            .map(|v| v.as_str().map(ToString::to_string).unwrap_or_else(|| v.to_string()))
                            .collect();
                        line.push_str(&format!(" one of [{}]", shown.join(", ")));
                    }
                    if let Some(description) = spec.get("description").and_then(Value::as_str) {
                        line.push_str(&format!(": {description}"));
                    }
                    if required.contains(&name.as_str()) {
                        line.push_str(" (required)");
                    }
                    block.push_str(&line);
                    block.push('\n');
                }
            }
            block
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Truncate to at most `max_chars` characters, appending `…` when cut.
/// The cut lands on a character boundary, never mid-codepoint.
pub fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut_at, _)) => format!("{}…", &text[..cut_at]),
        None => text.to_string(),
    }
}
