//! One-off check of a URL.

use std::time::Duration;

use chrono::{DateTime, Utc};
use miette::Result;
use serde::Serialize;

use webintel_monitor::{
    AnalysisOutput, Analyzer, ContentFetcher, HeuristicAnalyzer, HttpFetcher, MonitorError,
};

/// What `webintel check` prints.
#[derive(Debug, Serialize)]
pub struct CheckReport {
    pub url: String,
    pub status_code: u16,
    pub fetched_at: DateTime<Utc>,
    pub content_hash: String,
    pub content_length: usize,
    pub analysis: AnalysisOutput,
}

/// Fetch `url` and analyze it as a first capture.
pub async fn check(url: &str, fetch_timeout: Duration) -> Result<CheckReport, MonitorError> {
    let fetcher = HttpFetcher::new(fetch_timeout)?;
    let fetched = fetcher.fetch(url).await?;
    let analysis = HeuristicAnalyzer.analyze(url, None, &fetched.content);

    Ok(CheckReport {
        content_length: fetched.content.chars().count(),
        url: fetched.url,
        status_code: fetched.status_code,
        fetched_at: fetched.fetched_at,
        content_hash: fetched.content_hash,
        analysis,
    })
}

pub async fn run(url: &str, fetch_timeout: Duration) -> Result<()> {
    let report = check(url, fetch_timeout)
        .await
        .map_err(|e| miette::miette!("check failed: {}", e))?;
    let json = serde_json::to_string_pretty(&report)
        .map_err(|e| miette::miette!("failed to serialize report: {}", e))?;
    println!("{json}");
    Ok(())
}
