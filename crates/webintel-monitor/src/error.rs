//! Error types for the monitor pipeline.

use thiserror::Error;
use webintel_scheduler::JobError;

/// Errors that can occur while polling a monitor.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// HTTP request failed (connection, timeout, redirect loop, body decode).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The target answered with a non-2xx status.
    #[error("unexpected status {status} from {url}")]
    Status { url: String, status: u16 },

    /// The monitor URL cannot be fetched.
    #[error("invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Repository operation failed.
    #[error("repository error: {0}")]
    Repository(String),

    /// The monitor job did not complete.
    #[error(transparent)]
    Job(#[from] JobError),
}
