//! Retrieval core: filter build → search → parallel bulk read →
//! post-filter → rerank.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{NaiveDate, TimeZone, Utc};
use futures::StreamExt;
use tracing::{debug, info, warn};

use beamline_rerank::{RerankCandidate, Reranker};

use crate::client::{ElogApi, RawEntry, parse_date_bound, parse_entry_timestamp};
use crate::text::clean_html;
use crate::{ElogError, ElogHit, SearchOutcome};

/// Fixed worker-pool size for the bulk record fetch.
pub const PARALLEL_READERS: usize = 10;

const DEFAULT_MAX_RESULTS: usize = 10;
const MIN_FETCH_BUDGET: usize = 20;
const MAX_FETCH_BUDGET: usize = 200;

/// Caller-facing search request.
#[derive(Debug, Clone, Default)]
pub struct SearchParams {
    pub query: Option<String>,
    /// `YYYY-MM-DD` or dotted `DD.MM.YYYY`.
    pub since: Option<String>,
    pub until: Option<String>,
    pub category: Option<String>,
    pub system: Option<String>,
    pub domain: Option<String>,
    /// 0 means the default of 10.
    pub max_results: usize,
}

/// Structured filter sent to the logbook search endpoint.
///
/// The server-side date filter is not reliable, so `since`/`until` never
/// appear here; they are enforced client-side after the bulk read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterExpression {
    pub text: Option<String>,
    /// Client-side detection: a query containing `.*` is a regex.
    pub regex: bool,
    pub category: Option<String>,
    pub system: Option<String>,
    pub domain: Option<String>,
}

impl FilterExpression {
    pub fn from_params(params: &SearchParams) -> Self {
        let text = params
            .query
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(ToString::to_string);
        let regex = text.as_deref().is_some_and(|q| q.contains(".*"));
        Self {
            text,
            regex,
            category: params.category.clone(),
            system: params.system.clone(),
            domain: params.domain.clone(),
        }
    }

    pub fn to_query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        if let Some(ref text) = self.text {
            let key = if self.regex { "regexp" } else { "subtext" };
            pairs.push((key.to_string(), text.clone()));
        }
        for (key, value) in [
            ("Category", &self.category),
            ("System", &self.system),
            ("Domain", &self.domain),
        ] {
            if let Some(value) = value {
                pairs.push((key.to_string(), value.clone()));
            }
        }
        pairs
    }
}

// ── Search core ──────────────────────────────────────────────────────────────

pub struct ElogSearch {
    api: Arc<dyn ElogApi>,
    reranker: Arc<Reranker>,
}

impl ElogSearch {
    pub fn new(api: Arc<dyn ElogApi>, reranker: Arc<Reranker>) -> Self {
        Self { api, reranker }
    }

    pub(crate) fn api(&self) -> &Arc<dyn ElogApi> {
        &self.api
    }

    pub async fn search(&self, params: &SearchParams) -> Result<SearchOutcome, ElogError> {
        let k = if params.max_results == 0 {
            DEFAULT_MAX_RESULTS
        } else {
            params.max_results
        };
        let budget = (3 * k).max(MIN_FETCH_BUDGET).min(MAX_FETCH_BUDGET);
        let filter = FilterExpression::from_params(params);

        let ids = match self.api.search(&filter, budget).await {
            Ok(ids) => ids,
            Err(error) => {
                warn!(%error, "logbook search failed, treating as no data");
                return Ok(SearchOutcome::default());
            }
        };
        debug!(requested = budget, returned = ids.len(), "logbook id search");

        let entries = self.bulk_read(&ids).await;

        let since = params.since.as_deref().and_then(parse_date_bound);
        let until = params.until.as_deref().and_then(parse_date_bound);
        let mut hits: Vec<ElogHit> = entries
            .into_iter()
            .map(|entry| self.build_hit(entry))
            .filter(|hit| within_bounds(hit, since, until))
            .collect();

        let total_found = hits.len();
        let (by_category, by_system, by_domain) = aggregate(&hits);

        // Rerank on a blocking thread: cross-encoder inference is CPU-bound.
        let candidates: Vec<RerankCandidate> = hits
            .iter()
            .map(|hit| RerankCandidate {
                title: hit.title.clone(),
                body: hit.body_clean.clone(),
                timestamp: hit.timestamp,
                category: hit.category.clone(),
            })
            .collect();
        let reranker = Arc::clone(&self.reranker);
        let query = filter.text.clone().unwrap_or_default();
        let now = Utc::now();
        let ranked = tokio::task::spawn_blocking(move || {
            reranker.rerank(&query, &candidates, k, now)
        })
        .await
        .map_err(|e| ElogError::Decode(format!("rerank task failed: {e}")))?;

        let mut selected = Vec::with_capacity(ranked.len());
        for r in ranked {
            let mut hit = hits[r.index].clone();
            hit.semantic_score = r.semantic_score;
            hit.final_score = r.final_score;
            selected.push(hit);
        }
        hits = selected;

        info!(total_found, returned = hits.len(), "logbook search complete");
        Ok(SearchOutcome {
            total_found,
            hits,
            by_category,
            by_system,
            by_domain,
        })
    }

    /// Fan one read per id over a pool of [`PARALLEL_READERS`] workers.
    /// Failed reads are dropped with a warning; they never abort the batch.
    pub(crate) async fn bulk_read(&self, ids: &[u64]) -> Vec<RawEntry> {
        let results: Vec<Option<RawEntry>> = futures::stream::iter(ids.iter().copied())
            .map(|id| {
                let api = Arc::clone(&self.api);
                async move {
                    match api.read(id).await {
                        Ok(entry) => Some(entry),
                        Err(error) => {
                            warn!(id, %error, "dropping unreadable logbook entry");
                            None
                        }
                    }
                }
            })
            .buffered(PARALLEL_READERS)
            .collect()
            .await;
        results.into_iter().flatten().collect()
    }

    pub(crate) fn build_hit(&self, entry: RawEntry) -> ElogHit {
        let attr = |key: &str| entry.attributes.get(key).cloned().unwrap_or_default();
        let timestamp = entry
            .attributes
            .get("Date")
            .and_then(|raw| parse_entry_timestamp(raw));
        ElogHit {
            id: entry.id,
            timestamp,
            author: attr("Author"),
            category: attr("Category"),
            system: attr("System"),
            domain: attr("Domain"),
            title: attr("Subject"),
            body_clean: clean_html(&entry.body_html),
            body_html: entry.body_html,
            url: self.api.entry_url(entry.id),
            attachments: entry.attachments,
            semantic_score: 0.0,
            final_score: 0.0,
        }
    }
}

/// Client-side date window, inclusive on both ends.  When a bound is set,
/// entries whose timestamp could not be parsed are excluded: they cannot
/// be shown to satisfy the window.
fn within_bounds(hit: &ElogHit, since: Option<NaiveDate>, until: Option<NaiveDate>) -> bool {
    if since.is_none() && until.is_none() {
        return true;
    }
    let Some(ts) = hit.timestamp else { return false };
    let ts = ts.with_timezone(&Utc);
    if let Some(since) = since {
        let start = Utc.from_utc_datetime(&since.and_hms_opt(0, 0, 0).unwrap());
        if ts < start {
            return false;
        }
    }
    if let Some(until) = until {
        let end = Utc.from_utc_datetime(&until.and_hms_opt(23, 59, 59).unwrap());
        if ts > end {
            return false;
        }
    }
    true
}

fn aggregate(
    hits: &[ElogHit],
) -> (
    HashMap<String, usize>,
    HashMap<String, usize>,
    HashMap<String, usize>,
) {
    let mut by_category = HashMap::new();
    let mut by_system = HashMap::new();
    let mut by_domain = HashMap::new();
    for hit in hits {
        for (map, value) in [
            (&mut by_category, &hit.category),
            (&mut by_system, &hit.system),
            (&mut by_domain, &hit.domain),
        ] {
            if !value.is_empty() {
                *map.entry(value.clone()).or_insert(0) += 1;
            }
        }
    }
    (by_category, by_system, by_domain)
}

// ── Tests ────────────────────────────────────────────────────────────────────
