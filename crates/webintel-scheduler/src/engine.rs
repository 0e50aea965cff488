//! Scheduler engine implementation.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::{Job, JobSnapshot, Runnable};

/// Heap key. Ordered by due time, then by insertion sequence.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct HeapEntry {
    run_at: Instant,
    sequence: u64,
    job_id: String,
}

struct ScheduledJob {
    job: Arc<dyn Runnable>,
    run_at: Instant,
    interval: Option<Duration>,
    cancelled: bool,
    /// Identifies one `schedule()` call; survives recurring requeues.
    generation: u64,
    /// Sequence of the live heap entry for this job.
    sequence: u64,
}

#[derive(Default)]
struct EngineState {
    heap: BinaryHeap<Reverse<HeapEntry>>,
    jobs: HashMap<String, ScheduledJob>,
    /// Generation of the in-flight execution per job id.
    running: HashMap<String, u64>,
    next_sequence: u64,
    next_generation: u64,
    stopped: bool,
}

impl EngineState {
    fn push(&mut self, job_id: &str, run_at: Instant) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.heap.push(Reverse(HeapEntry {
            run_at,
            sequence,
            job_id: job_id.to_string(),
        }));
        sequence
    }
}

/// Stand-in due time for delays that overflow the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `now + delay`, saturating to roughly thirty years out.
fn deadline_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay).unwrap_or_else(|| now + FAR_FUTURE)
}

fn same_job(a: &Arc<dyn Runnable>, b: &Arc<dyn Runnable>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

#[derive(Default)]
struct EngineInner {
    state: Mutex<EngineState>,
    wakeup: Notify,
}

impl EngineInner {
    /// Bookkeeping after an execution of `job_id` returns.
    fn finish(&self, job_id: &str, generation: u64) {
        let mut state = self.state.lock();

        if state.running.get(job_id) == Some(&generation) {
            state.running.remove(job_id);
        }

        let Some(scheduled) = state.jobs.get(job_id) else {
            return;
        };
        if scheduled.generation != generation {
            // Replaced by a newer schedule() while running.
            return;
        }

        let drop_entry = scheduled.cancelled || scheduled.job.is_cancelled() || state.stopped;
        let interval = scheduled.interval;
        match interval {
            Some(interval) if !drop_entry => {
                let run_at = deadline_after(interval);
                let sequence = state.push(job_id, run_at);
                if let Some(scheduled) = state.jobs.get_mut(job_id) {
                    scheduled.run_at = run_at;
                    scheduled.sequence = sequence;
                }
                drop(state);
                debug!(job_id, ?interval, "requeued recurring job");
                self.wakeup.notify_one();
            }
            _ => {
                state.jobs.remove(job_id);
            }
        }
    }
}

/// Single-process, in-memory scheduler.
///
/// Pending executions live in a min-heap keyed by due time; the run loop
/// sleeps until the earliest one is due or until `schedule`, `cancel` or
/// `stop` wakes it. Each due job runs on its own task so slow handlers never
/// hold up the loop. Cloning the engine yields another handle to the same
/// state.
#[derive(Clone, Default)]
pub struct SchedulerEngine {
    inner: Arc<EngineInner>,
}

impl SchedulerEngine {
    /// Create an engine with an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `job` to run after `delay`, then every `interval` if given.
    ///
    /// The interval is measured from the moment a run completes, so a slow
    /// handler pushes later runs back instead of overlapping. A zero interval
    /// means one-shot. If a job with the same id is already scheduled, it is
    /// cancelled and replaced. Rescheduling the same job while it is running
    /// keeps the current execution and only changes its interval. Delays too
    /// large for the clock are clamped to a far-future due time.
    pub fn schedule<T: Send + 'static>(
        &self,
        job: Arc<Job<T>>,
        delay: Duration,
        interval: Option<Duration>,
    ) -> String {
        self.schedule_runnable(job, delay, interval)
    }

    /// Schedule a one-shot job.
    pub fn schedule_once<T: Send + 'static>(&self, job: Arc<Job<T>>, delay: Duration) -> String {
        self.schedule(job, delay, None)
    }

    /// Schedule a recurring job whose first run is immediate.
    pub fn schedule_recurring<T: Send + 'static>(
        &self,
        job: Arc<Job<T>>,
        interval: Duration,
    ) -> String {
        self.schedule(job, Duration::ZERO, Some(interval))
    }

    fn schedule_runnable(
        &self,
        job: Arc<dyn Runnable>,
        delay: Duration,
        interval: Option<Duration>,
    ) -> String {
        let job_id = job.id().to_string();
        let interval = interval.filter(|i| !i.is_zero());
        let run_at = deadline_after(delay);

        let replaced = {
            let mut state = self.inner.state.lock();

            // Rescheduling a job that is mid-execution only swaps its
            // interval; the next run is armed when the current one finishes.
            let in_flight = state.running.contains_key(&job_id);
            if in_flight
                && let Some(existing) = state
                    .jobs
                    .get_mut(&job_id)
                    .filter(|s| !s.cancelled && same_job(&s.job, &job))
            {
                existing.interval = interval;
                debug!(job_id = %job_id, ?interval, "updated interval of running job");
                return job_id;
            }

            let replaced = state.jobs.remove(&job_id).map(|previous| previous.job);
            // A running execution of the replaced job finishes detached; its
            // completion sees a newer generation and leaves this entry alone.
            state.running.remove(&job_id);

            let generation = state.next_generation;
            state.next_generation += 1;
            let sequence = state.push(&job_id, run_at);
            state.jobs.insert(
                job_id.clone(),
                ScheduledJob {
                    job: Arc::clone(&job),
                    run_at,
                    interval,
                    cancelled: false,
                    generation,
                    sequence,
                },
            );
            replaced
        };

        if let Some(previous) = replaced
            && !same_job(&previous, &job)
        {
            debug!(job_id = %job_id, "replacing scheduled job");
            previous.cancel();
        }

        debug!(job_id = %job_id, ?delay, ?interval, "scheduled job");
        self.inner.wakeup.notify_one();
        job_id
    }

    /// Cancel a scheduled job.
    ///
    /// A queued job never runs; a running one has its job cancelled, which
    /// the execution observes at its next suspension point. Returns whether
    /// a live job with this id was found.
    pub fn cancel(&self, job_id: &str) -> bool {
        let job = {
            let mut state = self.inner.state.lock();
            let Some(scheduled) = state.jobs.get_mut(job_id).filter(|s| !s.cancelled) else {
                return false;
            };
            scheduled.cancelled = true;
            Arc::clone(&scheduled.job)
        };

        job.cancel();
        info!(job_id, "cancelled scheduled job");
        self.inner.wakeup.notify_one();
        true
    }

    /// Stop the run loop and cancel every running execution.
    pub fn stop(&self) {
        let running: Vec<Arc<dyn Runnable>> = {
            let mut state = self.inner.state.lock();
            state.stopped = true;
            state
                .running
                .keys()
                .filter_map(|id| state.jobs.get(id))
                .map(|scheduled| Arc::clone(&scheduled.job))
                .collect()
        };

        for job in &running {
            job.cancel();
        }
        info!(cancelled = running.len(), "scheduler engine stop requested");
        self.inner.wakeup.notify_one();
    }

    /// Run the scheduling loop until [`stop`](Self::stop) is called.
    pub async fn run_forever(&self) {
        info!("scheduler engine starting");

        loop {
            let deadline = {
                let mut state = self.inner.state.lock();
                if state.stopped {
                    break;
                }

                let next_due = state.heap.peek().map(|Reverse(entry)| entry.run_at);
                match next_due {
                    None => None,
                    Some(run_at) if run_at > Instant::now() => Some(run_at),
                    Some(_) => {
                        self.dispatch_next(&mut state);
                        continue;
                    }
                }
            };

            match deadline {
                None => self.inner.wakeup.notified().await,
                Some(run_at) => {
                    tokio::select! {
                        _ = sleep_until(run_at) => {}
                        _ = self.inner.wakeup.notified() => {}
                    }
                }
            }
        }

        info!("scheduler engine stopped");
    }

    /// Spawn [`run_forever`](Self::run_forever) onto the tokio runtime.
    pub fn spawn(&self) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move { engine.run_forever().await })
    }

    /// Pop the earliest heap entry and launch it unless it is stale.
    fn dispatch_next(&self, state: &mut EngineState) {
        let Some(Reverse(entry)) = state.heap.pop() else {
            return;
        };

        let Some(scheduled) = state.jobs.get(&entry.job_id) else {
            debug!(job_id = %entry.job_id, "discarding heap entry for unknown job");
            return;
        };
        if scheduled.sequence != entry.sequence {
            debug!(job_id = %entry.job_id, "discarding superseded heap entry");
            return;
        }
        if scheduled.cancelled {
            debug!(job_id = %entry.job_id, "discarding cancelled job");
            state.jobs.remove(&entry.job_id);
            return;
        }

        let job = Arc::clone(&scheduled.job);
        let generation = scheduled.generation;
        let inner = Arc::clone(&self.inner);
        let job_id = entry.job_id.clone();

        debug!(job_id = %job_id, "launching job");
        tokio::spawn(async move {
            let execution = tokio::spawn(async move { job.run().await });
            if let Err(e) = execution.await
                && e.is_panic()
            {
                warn!(job_id = %job_id, "job handler panicked");
            }
            inner.finish(&job_id, generation);
        });

        state.running.insert(entry.job_id, generation);
    }

    /// Snapshots of every live scheduled job, sorted by id.
    pub fn list_jobs(&self) -> Vec<JobSnapshot> {
        let state = self.inner.state.lock();
        let mut jobs: Vec<JobSnapshot> = state
            .jobs
            .values()
            .filter(|scheduled| !scheduled.cancelled)
            .map(|scheduled| scheduled.job.snapshot())
            .collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        jobs
    }

    /// Snapshot of a live scheduled job.
    pub fn get_job(&self, job_id: &str) -> Option<JobSnapshot> {
        let state = self.inner.state.lock();
        state
            .jobs
            .get(job_id)
            .filter(|scheduled| !scheduled.cancelled)
            .map(|scheduled| scheduled.job.snapshot())
    }

    /// When a live scheduled job is next due, if it is waiting in the queue.
    pub fn next_run(&self, job_id: &str) -> Option<Instant> {
        let state = self.inner.state.lock();
        if state.running.contains_key(job_id) {
            return None;
        }
        state
            .jobs
            .get(job_id)
            .filter(|scheduled| !scheduled.cancelled)
            .map(|scheduled| scheduled.run_at)
    }

    /// Number of live jobs waiting for their due time.
    pub fn pending_count(&self) -> usize {
        let state = self.inner.state.lock();
        state
            .jobs
            .iter()
            .filter(|(id, scheduled)| !scheduled.cancelled && !state.running.contains_key(*id))
            .count()
    }

    /// Number of executions currently in flight.
    pub fn running_count(&self) -> usize {
        self.inner.state.lock().running.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.state.lock().stopped
    }
}
