//! Job lifecycle: attempts, retry with fixed backoff, cancellation.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{HandlerError, JobError, JobHooks, NoopHooks};

/// Boxed future returned by a job handler.
pub type JobFuture<T> = Pin<Box<dyn Future<Output = Result<T, HandlerError>> + Send>>;

/// Type alias for the job handler function.
pub type JobHandler<T> = Box<dyn Fn() -> JobFuture<T> + Send + Sync>;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Created, never executed.
    #[default]
    Pending,
    /// An attempt is in progress.
    Running,
    /// An attempt failed; waiting out the backoff before the next one.
    Retrying,
    /// The last execution completed successfully.
    Succeeded,
    /// The last execution ran out of retries.
    Failed,
    /// Cancelled. Never leaves this state.
    Cancelled,
}

impl JobState {
    /// Whether no further transition is expected from this state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Retrying => "retrying",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of a job's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: String,
    pub state: JobState,
    /// Total handler invocations across all executions.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct JobStatus {
    state: JobState,
    attempts: u32,
    last_error: Option<String>,
    last_started_at: Option<DateTime<Utc>>,
    last_finished_at: Option<DateTime<Utc>>,
}

impl JobStatus {
    fn snapshot(&self, id: &str) -> JobSnapshot {
        JobSnapshot {
            id: id.to_string(),
            state: self.state,
            attempts: self.attempts,
            last_error: self.last_error.clone(),
            last_started_at: self.last_started_at,
            last_finished_at: self.last_finished_at,
        }
    }
}

/// A named unit of asynchronous work with a retry policy.
///
/// The handler is invoked once per attempt. A failed attempt is retried after
/// a fixed backoff until `max_retries` retries have been used, at which point
/// the failure becomes terminal for that execution. Cancellation is never
/// retried.
pub struct Job<T = ()> {
    id: String,
    handler: JobHandler<T>,
    max_retries: u32,
    retry_backoff: Duration,
    hooks: Arc<dyn JobHooks>,
    status: Mutex<JobStatus>,
    cancellation: CancellationToken,
}

impl<T> fmt::Debug for Job<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff", &self.retry_backoff)
            .field("status", &*self.status.lock())
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Job<T> {
    /// Create a job with no retries and no hooks.
    pub fn new<F, Fut>(id: impl Into<String>, handler: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, HandlerError>> + Send + 'static,
    {
        Self {
            id: id.into(),
            handler: Box::new(move || Box::pin(handler())),
            max_retries: 0,
            retry_backoff: Duration::ZERO,
            hooks: Arc::new(NoopHooks),
            status: Mutex::new(JobStatus::default()),
            cancellation: CancellationToken::new(),
        }
    }

    /// Allow up to `max_retries` retries after the first failed attempt.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Wait this long between a failed attempt and the next one.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Attach a lifecycle observer.
    pub fn with_hooks(mut self, hooks: Arc<dyn JobHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Run the handler until it succeeds, fails terminally, or is cancelled.
    #[tracing::instrument(skip(self), fields(job_id = %self.id))]
    pub async fn execute(&self) -> Result<T, JobError> {
        let mut attempt: u32 = 0;

        loop {
            if self.cancellation.is_cancelled() {
                return Err(self.finish_cancelled());
            }

            attempt += 1;
            let started = Instant::now();
            let snapshot = {
                let mut status = self.status.lock();
                status.state = JobState::Running;
                status.attempts += 1;
                status.last_started_at = Some(Utc::now());
                status.snapshot(&self.id)
            };
            self.hooks.on_job_started(&snapshot);

            let outcome = tokio::select! {
                biased;
                _ = self.cancellation.cancelled() => None,
                result = (self.handler)() => Some(result),
            };
            let elapsed = started.elapsed();

            let error = match outcome {
                None => return Err(self.finish_cancelled()),
                Some(Ok(value)) => {
                    let snapshot = {
                        let mut status = self.status.lock();
                        if self.cancellation.is_cancelled() {
                            None
                        } else {
                            status.state = JobState::Succeeded;
                            status.last_error = None;
                            status.last_finished_at = Some(Utc::now());
                            Some(status.snapshot(&self.id))
                        }
                    };
                    let Some(snapshot) = snapshot else {
                        return Err(self.finish_cancelled());
                    };
                    debug!(attempt, ?elapsed, "job succeeded");
                    self.hooks.on_job_succeeded(&snapshot, elapsed);
                    return Ok(value);
                }
                Some(Err(error)) => error,
            };

            let message = error.to_string();
            let retrying = attempt <= self.max_retries;
            let snapshot = {
                let mut status = self.status.lock();
                if self.cancellation.is_cancelled() {
                    None
                } else {
                    status.last_error = Some(message.clone());
                    if retrying {
                        status.state = JobState::Retrying;
                    } else {
                        status.state = JobState::Failed;
                        status.last_finished_at = Some(Utc::now());
                    }
                    Some(status.snapshot(&self.id))
                }
            };
            let Some(snapshot) = snapshot else {
                return Err(self.finish_cancelled());
            };

            if !retrying {
                warn!(attempt, error = %message, "job failed, retries exhausted");
                self.hooks.on_job_failed(&snapshot, &*error, elapsed);
                return Err(JobError::Failed {
                    job_id: self.id.clone(),
                    attempts: attempt,
                    message,
                });
            }

            debug!(attempt, error = %message, backoff = ?self.retry_backoff, "job attempt failed, retrying");
            self.hooks
                .on_job_retry(&snapshot, &*error, self.retry_backoff);

            if !self.retry_backoff.is_zero() {
                tokio::select! {
                    biased;
                    _ = self.cancellation.cancelled() => return Err(self.finish_cancelled()),
                    _ = sleep(self.retry_backoff) => {}
                }
            }
        }
    }
}

impl<T> Job<T> {
    /// The job's identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn retry_backoff(&self) -> Duration {
        self.retry_backoff
    }

    /// Current lifecycle state.
    pub fn state(&self) -> JobState {
        self.status.lock().state
    }

    /// Total handler invocations so far.
    pub fn attempts(&self) -> u32 {
        self.status.lock().attempts
    }

    /// Message of the most recent failed attempt, cleared on success.
    pub fn last_error(&self) -> Option<String> {
        self.status.lock().last_error.clone()
    }

    /// Copy of the job's bookkeeping.
    pub fn snapshot(&self) -> JobSnapshot {
        self.status.lock().snapshot(&self.id)
    }

    /// Token tripped when the job is cancelled.
    ///
    /// Handlers that hold long critical sections can check this between steps.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Force the job into `Cancelled`.
    ///
    /// Works whether or not an execution is in flight; a running `execute()`
    /// observes the token at its next suspension point. Calling this on an
    /// already cancelled job does nothing.
    pub fn cancel(&self) {
        let snapshot = {
            let mut status = self.status.lock();
            if self.cancellation.is_cancelled() {
                return;
            }
            status.state = JobState::Cancelled;
            self.cancellation.cancel();
            status.snapshot(&self.id)
        };
        debug!(job_id = %self.id, "job cancelled");
        self.hooks.on_job_cancelled(&snapshot);
    }

    fn finish_cancelled(&self) -> JobError {
        let mut status = self.status.lock();
        status.state = JobState::Cancelled;
        status.last_finished_at = Some(Utc::now());
        JobError::Cancelled {
            job_id: self.id.clone(),
        }
    }
}

/// Type-erased view of a [`Job`] used by the scheduler engine.
#[async_trait]
pub trait Runnable: Send + Sync {
    fn id(&self) -> &str;

    /// Execute the job, absorbing its outcome.
    async fn run(&self);

    fn cancel(&self);

    fn is_cancelled(&self) -> bool;

    fn snapshot(&self) -> JobSnapshot;
}

#[async_trait]
impl<T: Send + 'static> Runnable for Job<T> {
    fn id(&self) -> &str {
        Job::id(self)
    }

    async fn run(&self) {
        match self.execute().await {
            Ok(_) => {}
            Err(JobError::Cancelled { .. }) => {
                debug!(job_id = %self.id, "scheduled execution cancelled");
            }
            Err(e) => {
                debug!(job_id = %self.id, error = %e, "scheduled execution failed");
            }
        }
    }

    fn cancel(&self) {
        Job::cancel(self)
    }

    fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    fn snapshot(&self) -> JobSnapshot {
        Job::snapshot(self)
    }
}
