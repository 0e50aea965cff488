//! Remote resource monitoring for WebIntel.
//!
//! A monitor polls a URL on a schedule. Each poll fetches the content,
//! fingerprints it, compares the fingerprint with the previous snapshot,
//! stores a new snapshot and enqueues an analysis of the change on the
//! scheduler engine.

mod analysis;
mod content;
mod error;
mod fetch;
mod pipeline;
mod repository;
mod types;

pub use analysis::{AnalysisOutput, Analyzer, HeuristicAnalyzer, LARGE_CONTENT_DELTA};
pub use content::{MonitorDiffResult, compute_content_hash, diff_hashes, normalize_content};
pub use error::MonitorError;
pub use fetch::{ContentFetcher, DEFAULT_FETCH_TIMEOUT, HttpFetcher, MonitorFetchResult};
pub use pipeline::{MonitorPipeline, PipelineConfig, analysis_job_id, monitor_job_id};
pub use repository::{
    InMemoryMonitorRepository, InMemoryTransaction, MonitorRepository, MonitorTransaction,
};
pub use types::MonitorSnapshot;
