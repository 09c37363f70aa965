//! Cross-encoder reranking with recency decay and category diversity.
//!
//! Candidates are scored query-against-document by a local cross-encoder,
//! boosted by how recent they are, then greedily selected under a
//! per-category cap.  Raw cross-encoder scores are only comparable within
//! a single call.

use std::sync::{Arc, OnceLock};

use chrono::{DateTime, FixedOffset, Utc};
use fastembed::{RerankInitOptions, RerankerModel, TextRerank};
use thiserror::Error;
use tracing::{debug, warn};

/// Recency half-life.  An entry this many hours old contributes
/// `1 + e^-1` instead of the fresh entry's `2.0`.
pub const HALF_LIFE_HOURS: f64 = 48.0;

/// Greedy diversity cap: at most this many picks per category, relaxed
/// only when the cap would leave fewer than K results.
pub const MAX_PER_CATEGORY: usize = 5;

/// Cross-encoder input budget, approximated as whitespace tokens.
const SEMANTIC_TOKEN_BUDGET: usize = 512;

#[derive(Debug, Error)]
pub enum RerankError {
    #[error("cross-encoder unavailable: {0}")]
    ModelUnavailable(String),
    #[error("scoring failed: {0}")]
    Scoring(String),
}

/// A candidate document as the reranker sees it.
#[derive(Debug, Clone)]
pub struct RerankCandidate {
    pub title: String,
    /// Tag-stripped, whitespace-normalized body text.
    pub body: String,
    pub timestamp: Option<DateTime<FixedOffset>>,
    pub category: String,
}

/// Scores for one selected candidate, referring back into the input slice.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankedCandidate {
    pub index: usize,
    pub semantic_score: f32,
    pub final_score: f32,
}

/// Query–document relevance scorer.  The production implementation is the
/// lazily loaded cross-encoder; tests substitute deterministic stubs.
pub trait SemanticScorer: Send + Sync {
    fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f32>, RerankError>;
}

// ── Cross-encoder scorer ─────────────────────────────────────────────────────

/// Lazily initialized cross-encoder shared across turns.
///
/// The model is loaded on first use behind an init-once cell; a load
/// failure is remembered so every later call degrades to the caller's
/// timestamp fallback instead of retrying an expensive download.
#[derive(Default)]
pub struct CrossEncoderScorer {
    model: OnceLock<Option<TextRerank>>,
}

impl CrossEncoderScorer {
    pub fn new() -> Self {
        Self::default()
    }

    fn model(&self) -> Option<&TextRerank> {
        self.model
            .get_or_init(|| {
                match TextRerank::try_new(RerankInitOptions::new(RerankerModel::BGERerankerBase)) {
                    Ok(model) => Some(model),
                    Err(error) => {
                        warn!(%error, "cross-encoder load failed, reranker degraded to timestamp ordering");
                        None
                    }
                }
            })
            .as_ref()
    }
}

impl SemanticScorer for CrossEncoderScorer {
    fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f32>, RerankError> {
        let model = self
            .model()
            .ok_or_else(|| RerankError::ModelUnavailable("load failed".to_string()))?;

        let docs: Vec<&str> = documents.iter().map(String::as_str).collect();
        let results = model
            .rerank(query, docs, false, None)
            .map_err(|e| RerankError::Scoring(e.to_string()))?;

        let mut scores = vec![0.0_f32; documents.len()];
        for result in results {
            if let Some(slot) = scores.get_mut(result.index) {
                *slot = result.score;
            }
        }
        Ok(scores)
    }
}

// ── Reranker ─────────────────────────────────────────────────────────────────

pub struct Reranker {
    scorer: Arc<dyn SemanticScorer>,
}

impl Default for Reranker {
    fn default() -> Self {
        Self::new()
    }
}

impl Reranker {
    pub fn new() -> Self {
        Self {
            scorer: Arc::new(CrossEncoderScorer::new()),
        }
    }

    pub fn with_scorer(scorer: Arc<dyn SemanticScorer>) -> Self {
        Self { scorer }
    }

    /// Pick the top `k` candidates.  `now` is passed in so scoring is a
    /// pure function of its inputs.
    ///
    /// Scoring is CPU-bound; async callers should wrap this in
    /// `spawn_blocking`.
    pub fn rerank(
        &self,
        query: &str,
        candidates: &[RerankCandidate],
        k: usize,
        now: DateTime<Utc>,
    ) -> Vec<RankedCandidate> {
        if k == 0 || candidates.is_empty() {
            return vec![];
        }

        let documents: Vec<String> = candidates
            .iter()
            .map(|c| truncate_tokens(&format!("{} {}", c.title, c.body), SEMANTIC_TOKEN_BUDGET))
            .collect();

        let semantic = match self.scorer.score(query, &documents) {
            Ok(scores) => scores,
            Err(error) => {
                warn!(%error, "semantic scoring unavailable, falling back to timestamp ordering");
                return timestamp_fallback(candidates, k);
            }
        };

        let mut scored: Vec<RankedCandidate> = candidates
            .iter()
            .enumerate()
            .map(|(index, candidate)| {
                let boost = recency_boost(candidate.timestamp, now);
                let raw = semantic[index] * boost as f32;
                RankedCandidate {
                    index,
                    semantic_score: semantic[index],
                    final_score: raw,
                }
            })
            .collect();

        // Stable order: score descending, input position as tie-break.
        scored.sort_by(|a, b| {
            b.final_score
                .total_cmp(&a.final_score)
                .then(a.index.cmp(&b.index))
        });

        debug!(candidates = scored.len(), k, "reranked");
        select_diverse(&scored, candidates, k)
    }
}

/// `1 + exp(-age_hours / half_life)`: fresh entries score close to 2.0,
/// old entries approach 1.0, unparsable timestamps stay neutral at 1.0.
pub fn recency_boost(timestamp: Option<DateTime<FixedOffset>>, now: DateTime<Utc>) -> f64 {
    let Some(ts) = timestamp else { return 1.0 };
    let age_hours = (now - ts.with_timezone(&Utc)).num_seconds().max(0) as f64 / 3600.0;
    1.0 + (-age_hours / HALF_LIFE_HOURS).exp()
}

/// Greedy selection over score-sorted candidates under the category cap.
/// When the cap alone cannot fill K slots, it relaxes and the skipped
/// candidates are admitted in score order.
fn select_diverse(
    sorted: &[RankedCandidate],
    candidates: &[RerankCandidate],
    k: usize,
) -> Vec<RankedCandidate> {
    let mut picked: Vec<RankedCandidate> = Vec::with_capacity(k);
    let mut skipped: Vec<RankedCandidate> = Vec::new();
    let mut per_category: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();

    for ranked in sorted {
        if picked.len() == k {
            break;
        }
        let category = candidates[ranked.index].category.as_str();
        let count = per_category.entry(category).or_insert(0);
        if *count < MAX_PER_CATEGORY {
            *count += 1;
            picked.push(*ranked);
        } else {
            skipped.push(*ranked);
        }
    }

    for ranked in skipped {
        if picked.len() == k {
            break;
        }
        picked.push(ranked);
    }

    picked
}

fn timestamp_fallback(candidates: &[RerankCandidate], k: usize) -> Vec<RankedCandidate> {
    let mut order: Vec<usize> = (0..candidates.len()).collect();
    order.sort_by(|&a, &b| {
        let ta = candidates[a].timestamp;
        let tb = candidates[b].timestamp;
        // Newest first, undated entries last, input position as tie-break.
        tb.cmp(&ta).then(a.cmp(&b))
    });
    order
        .into_iter()
        .take(k)
        .map(|index| RankedCandidate {
            index,
            semantic_score: 0.0,
            final_score: 0.0,
        })
        .collect()
}

/// Keep the first `budget` whitespace-separated tokens.
fn truncate_tokens(text: &str, budget: usize) -> String {
    let mut tokens = text.split_whitespace();
    let head: Vec<&str> = tokens.by_ref().take(budget).collect();
    head.join(" ")
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    /// Scores each document by how many query words it contains.
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

    struct FailingScorer;

    impl SemanticScorer for FailingScorer {
        fn score(&self, _query: &str, _documents: &[String]) -> Result<Vec<f32>, RerankError> {
            Err(RerankError::ModelUnavailable("test".to_string()))
        }
    }

    fn at(hours_ago: i64, now: DateTime<Utc>) -> Option<DateTime<FixedOffset>> {
        Some((now - chrono::Duration::hours(hours_ago)).fixed_offset())
    }

    fn candidate(title: &str, body: &str, category: &str, ts: Option<DateTime<FixedOffset>>) -> RerankCandidate {
        RerankCandidate {
            title: title.to_string(),
            body: body.to_string(),
            timestamp: ts,
            category: category.to_string(),
        }
    }

    fn test_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, 15, 12, 0, 0).unwrap()
    }

    // ── recency boost ──────────────────────────────────────────────────────

    #[test]
    fn recency_boost_fresh_entry_near_two() {
        let now = test_now();
        let boost = recency_boost(at(0, now), now);
        assert!((boost - 2.0).abs() < 1e-6);
    }

    #[test]
    fn recency_boost_half_life() {
        let now = test_now();
        let boost = recency_boost(at(48, now), now);
        assert!((boost - (1.0 + (-1.0_f64).exp())).abs() < 1e-9);
    }

    #[test]
    fn recency_boost_missing_timestamp_is_neutral() {
        assert_eq!(recency_boost(None, test_now()), 1.0);
    }

    // ── ranking ────────────────────────────────────────────────────────────

    #[test]
    fn recency_breaks_semantic_ties() {
        let now = test_now();
        let reranker = Reranker::with_scorer(Arc::new(OverlapScorer));
        let candidates = vec![
            candidate("beam dump", "", "Info", at(24 * 30, now)),
            candidate("beam dump", "", "Info", at(1, now)),
        ];
        let ranked = reranker.rerank("beam dump", &candidates, 2, now);
        assert_eq!(ranked[0].index, 1, "fresher entry wins the tie");
        assert_eq!(ranked[1].index, 0);
    }

    #[test]
    fn output_bounded_by_k_and_drawn_from_input() {
        let now = test_now();
        let reranker = Reranker::with_scorer(Arc::new(OverlapScorer));
        let candidates: Vec<_> = (0..20)
            .map(|i| candidate(&format!("entry {i}"), "beam", "Info", at(i, now)))
            .collect();
        let ranked = reranker.rerank("beam", &candidates, 7, now);
        assert_eq!(ranked.len(), 7);
        for r in &ranked {
            assert!(r.index < candidates.len());
        }
    }

    #[test]
    fn diversity_cap_limits_category_dominance() {
        let now = test_now();
        let reranker = Reranker::with_scorer(Arc::new(OverlapScorer));
        // 8 strong RF entries, 2 weaker Vacuum entries.
        let mut candidates: Vec<_> = (0..8)
            .map(|i| candidate("rf trip rf trip", "", "RF", at(i, now)))
            .collect();
        candidates.push(candidate("rf note", "", "Vacuum", at(1, now)));
        candidates.push(candidate("rf note", "", "Vacuum", at(2, now)));

        let ranked = reranker.rerank("rf trip", &candidates, 7, now);
        let rf_picks = ranked
            .iter()
            .filter(|r| candidates[r.index].category == "RF")
            .count();
        assert_eq!(rf_picks, MAX_PER_CATEGORY);
        assert_eq!(ranked.len(), 7);
    }

    #[test]
    fn diversity_cap_relaxes_when_k_unreachable() {
        let now = test_now();
        let reranker = Reranker::with_scorer(Arc::new(OverlapScorer));
        // Only one category available: the cap must relax past 5.
        let candidates: Vec<_> = (0..9)
            .map(|i| candidate("septum scan", "", "Operation", at(i, now)))
            .collect();
        let ranked = reranker.rerank("septum", &candidates, 8, now);
        assert_eq!(ranked.len(), 8);
    }

    #[test]
    fn rerank_is_deterministic() {
        let now = test_now();
        let reranker = Reranker::with_scorer(Arc::new(OverlapScorer));
        let candidates: Vec<_> = (0..12)
            .map(|i| {
                candidate(
                    &format!("kicker fault {i}"),
                    "kicker magnet",
                    if i % 2 == 0 { "Operation" } else { "RF" },
                    at(i * 3, now),
                )
            })
            .collect();
        let first = reranker.rerank("kicker fault", &candidates, 6, now);
        let second = reranker.rerank("kicker fault", &candidates, 6, now);
        assert_eq!(first, second);
    }

    // ── degraded mode ──────────────────────────────────────────────────────

    #[test]
    fn scorer_failure_falls_back_to_timestamp_order() {
        let now = test_now();
        let reranker = Reranker::with_scorer(Arc::new(FailingScorer));
        let candidates = vec![
            candidate("old", "", "Info", at(100, now)),
            candidate("new", "", "Info", at(1, now)),
            candidate("undated", "", "Info", None),
        ];
        let ranked = reranker.rerank("anything", &candidates, 3, now);
        assert_eq!(ranked[0].index, 1);
        assert_eq!(ranked[1].index, 0);
        assert_eq!(ranked[2].index, 2, "undated entries sort last");
    }

    // ── helpers ────────────────────────────────────────────────────────────

    #[test]
    fn truncate_tokens_keeps_budget() {
        let text = "a b c d e";
        assert_eq!(truncate_tokens(text, 3), "a b c");
        assert_eq!(truncate_tokens(text, 50), "a b c d e");
    }

    #[test]
    fn empty_inputs_return_empty() {
        let reranker = Reranker::with_scorer(Arc::new(OverlapScorer));
        assert!(reranker.rerank("q", &[], 5, test_now()).is_empty());
        let candidates = vec![candidate("x", "", "Info", None)];
        assert!(reranker.rerank("q", &candidates, 0, test_now()).is_empty());
    }
}
