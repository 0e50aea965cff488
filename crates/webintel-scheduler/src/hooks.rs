//! Lifecycle observer for jobs.

use std::error::Error;
use std::time::Duration;

use crate::JobSnapshot;

/// Observer notified at each job lifecycle transition.
///
/// Every method has an empty default body, so implementors only override the
/// events they care about. Hooks are called synchronously from the executing
/// task and must not block.
pub trait JobHooks: Send + Sync {
    /// An attempt is about to invoke the handler.
    fn on_job_started(&self, _job: &JobSnapshot) {}

    /// An attempt failed and the job will run again after `retry_in`.
    fn on_job_retry(&self, _job: &JobSnapshot, _error: &(dyn Error + Send + Sync), _retry_in: Duration) {
    }

    /// The handler completed successfully. `duration` covers the final attempt.
    fn on_job_succeeded(&self, _job: &JobSnapshot, _duration: Duration) {}

    /// Retries are exhausted. `duration` covers the final attempt.
    fn on_job_failed(&self, _job: &JobSnapshot, _error: &(dyn Error + Send + Sync), _duration: Duration) {
    }

    /// The job was cancelled.
    fn on_job_cancelled(&self, _job: &JobSnapshot) {}
}

/// Hooks that ignore every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl JobHooks for NoopHooks {}
