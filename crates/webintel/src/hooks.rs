//! Job lifecycle logging.

use std::error::Error;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use webintel_scheduler::{JobHooks, JobSnapshot};

/// Reports every job transition as a structured tracing event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingHooks;

impl JobHooks for TracingHooks {
    fn on_job_started(&self, job: &JobSnapshot) {
        debug!(job_id = %job.id, attempt = job.attempts, "job started");
    }

    fn on_job_retry(&self, job: &JobSnapshot, err: &(dyn Error + Send + Sync), retry_in: Duration) {
        warn!(
            job_id = %job.id,
            attempts = job.attempts,
            error = %err,
            retry_in_ms = retry_in.as_millis() as u64,
            "job attempt failed, retrying"
        );
    }

    fn on_job_succeeded(&self, job: &JobSnapshot, duration: Duration) {
        info!(
            job_id = %job.id,
            attempts = job.attempts,
            duration_ms = duration.as_millis() as u64,
            "job succeeded"
        );
    }

    fn on_job_failed(&self, job: &JobSnapshot, err: &(dyn Error + Send + Sync), duration: Duration) {
        error!(
            job_id = %job.id,
            attempts = job.attempts,
            error = %err,
            duration_ms = duration.as_millis() as u64,
            "job failed"
        );
    }

    fn on_job_cancelled(&self, job: &JobSnapshot) {
        info!(job_id = %job.id, "job cancelled");
    }
}
