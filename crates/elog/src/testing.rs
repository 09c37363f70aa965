//! Scripted logbook for the crate's own tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use beamline_rerank::{RerankError, Reranker, SemanticScorer};

use crate::client::{ElogApi, RawEntry, ThreadLinks};
use crate::search::FilterExpression;
use crate::{Attachment, ElogError};

/// In-memory logbook: entries are returned newest-id-first, substring
/// matched against subject + body the way the server matches `subtext`.
#[derive(Default)]
pub(crate) struct FakeLog {
    entries: HashMap<u64, RawEntry>,
    unreadable: Vec<u64>,
    links: HashMap<u64, ThreadLinks>,
    fail_search: bool,
}

impl FakeLog {
    pub fn add_entry(
        &mut self,
        id: u64,
        subject: &str,
        body_html: &str,
        category: &str,
        system: &str,
        date: &str,
    ) {
        let mut attributes = HashMap::new();
        attributes.insert("Subject".to_string(), subject.to_string());
        attributes.insert("Category".to_string(), category.to_string());
        attributes.insert("System".to_string(), system.to_string());
        attributes.insert("Domain".to_string(), "Accelerator".to_string());
        attributes.insert("Author".to_string(), "operator".to_string());
        attributes.insert("Date".to_string(), date.to_string());
        self.entries.insert(
            id,
            RawEntry {
                id,
                body_html: body_html.to_string(),
                attributes,
                attachments: vec![],
            },
        );
    }

    pub fn add_attachment(&mut self, id: u64, name: &str, url: &str) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.attachments.push(Attachment {
                name: name.to_string(),
                url: url.to_string(),
            });
        }
    }

    /// Register an id the search returns but `read` refuses.
    pub fn add_unreadable(&mut self, id: u64) {
        self.unreadable.push(id);
    }

    pub fn link(&mut self, id: u64, parent: Option<u64>, replies: &[u64]) {
        self.links.insert(
            id,
            ThreadLinks {
                parent,
                replies: replies.to_vec(),
            },
        );
    }

    pub fn fail_search(&mut self) {
        self.fail_search = true;
    }
}

#[async_trait]
impl ElogApi for FakeLog {
    async fn search(
        &self,
        filter: &FilterExpression,
        n_results: usize,
    ) -> Result<Vec<u64>, ElogError> {
        if self.fail_search {
            return Err(ElogError::Status(503));
        }
        let needle = filter.text.as_deref().unwrap_or("");
        let mut ids: Vec<u64> = self
            .entries
            .values()
            .filter(|entry| {
                let subject = entry.attributes.get("Subject").cloned().unwrap_or_default();
                needle.is_empty()
                    || subject.contains(needle)
                    || entry.body_html.contains(needle)
                    || needle.split_whitespace().any(|w| subject.contains(w))
            })
            .map(|entry| entry.id)
            .chain(self.unreadable.iter().copied())
            .collect();
        ids.sort_unstable_by(|a, b| b.cmp(a));
        ids.truncate(n_results);
        Ok(ids)
    }

    async fn read(&self, id: u64) -> Result<RawEntry, ElogError> {
        if self.unreadable.contains(&id) {
            return Err(ElogError::Status(500));
        }
        self.entries.get(&id).cloned().ok_or(ElogError::NotFound(id))
    }

    async fn thread(&self, id: u64) -> Result<ThreadLinks, ElogError> {
        Ok(self.links.get(&id).cloned().unwrap_or_default())
    }

    fn entry_url(&self, id: u64) -> String {
        format!("https://elog.test/Operation/{id}")
    }
}

/// Word-overlap scorer: deterministic, model-free relevance for tests.
struct OverlapScorer;

impl SemanticScorer for OverlapScorer {
    fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f32>, RerankError> {
        let words: Vec<&str> = query.split_whitespace().collect();
        Ok(documents
            .iter()
            .map(|doc| words.iter().filter(|w| doc.contains(*w)).count() as f32)
            .collect())
    }
}

pub(crate) fn overlap_reranker() -> Reranker {
    Reranker::with_scorer(Arc::new(OverlapScorer))
}
