//! Search service over the external electronic-logbook HTTP API.
//!
//! Keyword/regex search, parallel bulk record fetch, cross-encoder
//! reranking with time decay and diversity, and thread navigation.
//! The logbook is strictly read-only from this system.

use std::collections::HashMap;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod client;
mod search;
#[cfg(test)]
pub(crate) mod testing;
mod text;
mod thread;

pub use client::{ElogApi, ElogClient, RawEntry, ThreadLinks, parse_date_bound, parse_entry_timestamp};
pub use search::{ElogSearch, FilterExpression, SearchParams, PARALLEL_READERS};
pub use text::clean_html;
pub use thread::ThreadGraph;

#[derive(Debug, Error)]
pub enum ElogError {
    #[error("logbook request failed: {0}")]
    Http(String),
    #[error("logbook returned status {0}")]
    Status(u16),
    #[error("malformed logbook response: {0}")]
    Decode(String),
    #[error("message {0} not found")]
    NotFound(u64),
    #[error("thread around {0} contains a cycle")]
    ThreadCycle(u64),
}

/// An attachment referenced by a logbook entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    pub url: String,
}

/// One scored logbook entry as returned to the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElogHit {
    pub id: u64,
    pub timestamp: Option<DateTime<FixedOffset>>,
    pub author: String,
    pub category: String,
    pub system: String,
    pub domain: String,
    pub title: String,
    pub body_html: String,
    /// Tag-stripped, whitespace-normalized body.  Derived once at hit
    /// construction and cached here.
    pub body_clean: String,
    pub url: String,
    pub attachments: Vec<Attachment>,
    pub semantic_score: f32,
    pub final_score: f32,
}

/// Result of one retrieval call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchOutcome {
    /// Entries that matched the filters, before rerank truncation.
    pub total_found: usize,
    pub hits: Vec<ElogHit>,
    pub by_category: HashMap<String, usize>,
    pub by_system: HashMap<String, usize>,
    pub by_domain: HashMap<String, usize>,
}
