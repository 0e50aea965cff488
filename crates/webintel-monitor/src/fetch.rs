//! Fetching monitored URLs.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::redirect::Policy;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::MonitorError;
use crate::content::compute_content_hash;

/// Default per-request timeout.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(15);

const MAX_REDIRECTS: usize = 10;

/// Outcome of one successful fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorFetchResult {
    pub url: String,
    pub fetched_at: DateTime<Utc>,
    pub status_code: u16,
    pub content: String,
    pub content_hash: String,
}

impl MonitorFetchResult {
    /// Build a result for `content`, fingerprinting it and stamping the current time.
    pub fn new(url: impl Into<String>, status_code: u16, content: String) -> Self {
        let content_hash = compute_content_hash(&content);
        Self {
            url: url.into(),
            fetched_at: Utc::now(),
            status_code,
            content,
            content_hash,
        }
    }
}

/// Retrieves the current content of a URL.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<MonitorFetchResult, MonitorError>;
}

/// [`ContentFetcher`] over HTTP(S).
///
/// Follows redirects and treats any non-2xx final status as an error.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    http: Client,
}

impl HttpFetcher {
    /// Create a fetcher whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, MonitorError> {
        let http = Client::builder()
            .timeout(timeout)
            .redirect(Policy::limited(MAX_REDIRECTS))
            .build()?;
        Ok(Self { http })
    }

    /// Wrap an already configured client.
    pub fn with_client(http: Client) -> Self {
        Self { http }
    }
}

fn parse_url(url: &str) -> Result<Url, MonitorError> {
    let parsed = Url::parse(url).map_err(|e| MonitorError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(MonitorError::InvalidUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme '{other}'"),
        }),
    }
}

#[async_trait]
impl ContentFetcher for HttpFetcher {
    #[tracing::instrument(skip(self))]
    async fn fetch(&self, url: &str) -> Result<MonitorFetchResult, MonitorError> {
        let target = parse_url(url)?;
        let response = self.http.get(target).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(MonitorError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let final_url = response.url().clone();
        let content = response.text().await?;
        let result = MonitorFetchResult::new(url, status.as_u16(), content);

        debug!(
            status = result.status_code,
            final_url = %final_url,
            bytes = result.content.len(),
            hash = %result.content_hash,
            "fetched monitored content"
        );
        Ok(result)
    }
}
