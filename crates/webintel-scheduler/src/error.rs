//! Error types for the scheduler.

use thiserror::Error;

/// Error type produced by job handlers.
///
/// Any error that is `Send + Sync` converts into this with `?`.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by a job execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// The job was cancelled before or during execution. Never retried.
    #[error("job cancelled: {job_id}")]
    Cancelled { job_id: String },

    /// The handler kept failing until its retries ran out.
    #[error("job {job_id} failed after {attempts} attempt(s): {message}")]
    Failed {
        job_id: String,
        attempts: u32,
        message: String,
    },
}

impl JobError {
    /// Whether this error represents a cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, JobError::Cancelled { .. })
    }
}
