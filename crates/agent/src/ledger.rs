//! Per-turn tool-call bookkeeping.
//!
//! The ledger enforces three invariants for every turn: a per-tool cap, a
//! total cap, and no repeated `(tool, arguments)` pair.  Arguments are
//! hashed over a canonical key-sorted rendering so `{a,b}` and `{b,a}`
//! collide.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;

use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// A single tool may be invoked at most this many times per turn.
pub const MAX_CALLS_PER_TOOL: usize = 3;

/// Hard cap on all tool invocations within one turn.
pub const MAX_TOTAL_CALLS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerRejection {
    #[error("duplicate invocation of `{0}` with identical arguments")]
    Duplicate(String),
    #[error("`{0}` reached its per-tool cap of {MAX_CALLS_PER_TOOL}")]
    ToolCap(String),
    #[error("turn reached the total cap of {MAX_TOTAL_CALLS} tool calls")]
    TotalCap,
}

#[derive(Debug, Default)]
pub struct UsageLedger {
    per_tool: HashMap<String, usize>,
    seen: HashSet<String>,
    total: usize,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit and record one invocation, or explain the rejection.
    pub fn admit(&mut self, tool: &str, arguments: &Value) -> Result<(), LedgerRejection> {
        if self.total >= MAX_TOTAL_CALLS {
            return Err(LedgerRejection::TotalCap);
        }
        let count = self.per_tool.get(tool).copied().unwrap_or(0);
        if count >= MAX_CALLS_PER_TOOL {
            return Err(LedgerRejection::ToolCap(tool.to_string()));
        }
        let hash = invocation_hash(tool, arguments);
        if !self.seen.insert(hash) {
            return Err(LedgerRejection::Duplicate(tool.to_string()));
        }
        self.per_tool.insert(tool.to_string(), count + 1);
        self.total += 1;
        Ok(())
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn count_for(&self, tool: &str) -> usize {
        self.per_tool.get(tool).copied().unwrap_or(0)
    }
}

fn invocation_hash(tool: &str, arguments: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(arguments, &mut canonical);
    let digest = Sha256::digest(format!("{tool}\u{1f}{canonical}"));
    let mut hex = String::with_capacity(64);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

/// Render a value with object keys sorted at every level, so the hash is
/// independent of the order the model emitted fields in.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let _ = write!(out, "{:?}:", key);
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => {
            let _ = write!(out, "{other}");
        }
    }
}
