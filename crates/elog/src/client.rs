//! Raw HTTP client for the logbook server.
//!
//! Three logical operations are consumed: `search` (filter map in, message
//! ids out, newest first), `read` (id in, html body + attribute map +
//! attachments out) and `thread` (id in, parent/reply edges out).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use tracing::warn;

use crate::ElogError;
use crate::{Attachment, search::FilterExpression};

/// Backoff before the single retry on a 5xx reply.
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// A raw logbook record before any scoring or cleaning.
#[derive(Debug, Clone)]
pub struct RawEntry {
    pub id: u64,
    pub body_html: String,
    pub attributes: HashMap<String, String>,
    pub attachments: Vec<Attachment>,
}

/// Parent/reply pointers of one message.
#[derive(Debug, Clone, Default)]
pub struct ThreadLinks {
    pub parent: Option<u64>,
    pub replies: Vec<u64>,
}

/// The logbook operations the retrieval core consumes.  The production
/// implementation is [`ElogClient`]; tests script this trait.
#[async_trait]
pub trait ElogApi: Send + Sync {
    /// Message ids matching the filter, newest first.
    async fn search(&self, filter: &FilterExpression, n_results: usize)
    -> Result<Vec<u64>, ElogError>;

    async fn read(&self, id: u64) -> Result<RawEntry, ElogError>;

    async fn thread(&self, id: u64) -> Result<ThreadLinks, ElogError>;

    /// Direct browser URL of one entry.
    fn entry_url(&self, id: u64) -> String;
}

// ── HTTP implementation ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ElogClient {
    client: reqwest::Client,
    base_url: String,
    logbook: String,
}

#[derive(Debug, Deserialize)]
struct SearchReply {
    #[serde(default)]
    ids: Vec<u64>,
}

#[derive(Debug, Deserialize)]
struct ReadReply {
    #[serde(default)]
    body: String,
    #[serde(default)]
    attributes: HashMap<String, String>,
    #[serde(default)]
    attachments: Vec<AttachmentReply>,
}

#[derive(Debug, Deserialize)]
struct AttachmentReply {
    name: String,
    url: String,
}

#[derive(Debug, Deserialize)]
struct ThreadReply {
    #[serde(default)]
    parent: Option<u64>,
    #[serde(default)]
    replies: Vec<u64>,
}

impl ElogClient {
    pub fn new(base_url: impl Into<String>, logbook: impl Into<String>, timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent("beamline/0.1")
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
            logbook: logbook.into(),
        }
    }

    fn api_url(&self, tail: &str) -> String {
        format!(
            "{}/api/{}/{tail}",
            self.base_url.trim_end_matches('/'),
            self.logbook
        )
    }

    /// GET with a single 500 ms-backoff retry on server errors.
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<T, ElogError> {
        let mut last_status = None;
        for attempt in 0..2 {
            if attempt > 0 {
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
            let response = self
                .client
                .get(url)
                .query(query)
                .send()
                .await
                .map_err(|e| ElogError::Http(e.to_string()))?;

            let status = response.status();
            if status.is_server_error() {
                warn!(%url, %status, attempt, "logbook server error");
                last_status = Some(status.as_u16());
                continue;
            }
            if !status.is_success() {
                return Err(ElogError::Status(status.as_u16()));
            }
            return response
                .json::<T>()
                .await
                .map_err(|e| ElogError::Decode(e.to_string()));
        }
        Err(ElogError::Status(last_status.unwrap_or(500)))
    }
}

#[async_trait]
impl ElogApi for ElogClient {
    async fn search(
        &self,
        filter: &FilterExpression,
        n_results: usize,
    ) -> Result<Vec<u64>, ElogError> {
        let mut query = filter.to_query_pairs();
        query.push(("n".to_string(), n_results.to_string()));
        let reply: SearchReply = self.get_json(&self.api_url("search"), &query).await?;
        Ok(reply.ids)
    }

    async fn read(&self, id: u64) -> Result<RawEntry, ElogError> {
        let reply: ReadReply = self.get_json(&self.api_url(&id.to_string()), &[]).await?;
        Ok(RawEntry {
            id,
            body_html: reply.body,
            attributes: reply.attributes,
            attachments: reply
                .attachments
                .into_iter()
                .map(|a| Attachment { name: a.name, url: a.url })
                .collect(),
        })
    }

    async fn thread(&self, id: u64) -> Result<ThreadLinks, ElogError> {
        let reply: ThreadReply = self
            .get_json(&self.api_url(&format!("{id}/thread")), &[])
            .await?;
        Ok(ThreadLinks {
            parent: reply.parent,
            replies: reply.replies,
        })
    }

    fn entry_url(&self, id: u64) -> String {
        format!("{}/{}/{id}", self.base_url.trim_end_matches('/'), self.logbook)
    }
}

// ── Date handling ────────────────────────────────────────────────────────────

/// Parse an entry timestamp from the attribute map.
///
/// The server emits RFC 2822 (`Wed, 15 Oct 2025 13:45:12 +0200`) on newer
/// installations and the dotted `15.10.2025 13:45:12` form on older ones;
/// ISO dates appear in hand-edited entries.  Dotted and ISO forms carry no
/// offset and are taken as UTC.
pub fn parse_entry_timestamp(raw: &str) -> Option<DateTime<FixedOffset>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(ts) = DateTime::parse_from_rfc2822(raw) {
        return Some(ts);
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%d.%m.%Y %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(Utc.from_utc_datetime(&naive).fixed_offset());
        }
    }
    for format in ["%Y-%m-%d", "%d.%m.%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            let naive = date.and_hms_opt(0, 0, 0)?;
            return Some(Utc.from_utc_datetime(&naive).fixed_offset());
        }
    }
    None
}

/// Parse a user-supplied `since`/`until` bound: `YYYY-MM-DD` or the
/// server's dotted `DD.MM.YYYY`.
pub fn parse_date_bound(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%d.%m.%Y"))
        .ok()
}
