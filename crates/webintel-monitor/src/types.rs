//! Records produced by a monitor poll.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::content::MonitorDiffResult;
use crate::fetch::MonitorFetchResult;

/// Persisted record of one observation of a monitored URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorSnapshot {
    pub monitor_id: String,
    pub url: String,
    pub fetched_at: DateTime<Utc>,
    pub status_code: u16,
    pub content: String,
    pub content_hash: String,
    /// Whether the hash differs from the previous snapshot. Always false for
    /// the first snapshot of a monitor.
    pub has_changed: bool,
}

impl MonitorSnapshot {
    pub fn from_fetch(
        monitor_id: impl Into<String>,
        fetch: MonitorFetchResult,
        diff: &MonitorDiffResult,
    ) -> Self {
        Self {
            monitor_id: monitor_id.into(),
            url: fetch.url,
            fetched_at: fetch.fetched_at,
            status_code: fetch.status_code,
            content: fetch.content,
            content_hash: fetch.content_hash,
            has_changed: diff.has_changed,
        }
    }
}
