//! Monitor pipeline: fetch, fingerprint, diff, persist, enqueue analysis.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use webintel_scheduler::{HandlerError, Job, JobHooks, NoopHooks, SchedulerEngine};

use crate::content::diff_hashes;
use crate::{
    Analyzer, ContentFetcher, DEFAULT_FETCH_TIMEOUT, HeuristicAnalyzer, HttpFetcher, MonitorError,
    MonitorRepository, MonitorSnapshot,
};

/// Retry and timeout settings for the jobs the pipeline builds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Per-request timeout for [`MonitorPipeline::with_http`].
    pub fetch_timeout: Duration,
    /// Retries of a failed monitor poll within one execution.
    pub fetch_retries: u32,
    pub fetch_backoff: Duration,
    /// Retries of a failed analysis job.
    pub analysis_retries: u32,
    pub analysis_backoff: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            fetch_retries: 0,
            fetch_backoff: Duration::ZERO,
            analysis_retries: 0,
            analysis_backoff: Duration::ZERO,
        }
    }
}

/// Job id of the poll job for a monitor.
pub fn monitor_job_id(monitor_id: &str) -> String {
    format!("monitor:{monitor_id}")
}

/// Job id of the analysis job for a monitor's content fingerprint.
///
/// Keyed on the first 12 hex characters of the hash, so observing the same
/// content again replaces a still-pending analysis instead of queueing a
/// second one.
pub fn analysis_job_id(monitor_id: &str, content_hash: &str) -> String {
    let prefix: String = content_hash.chars().take(12).collect();
    format!("analysis:{monitor_id}:{prefix}")
}

/// An enqueued analysis job that is withdrawn when dropped, unless the
/// snapshot that triggered it was committed first.
struct PendingAnalysis<'a> {
    scheduler: &'a SchedulerEngine,
    job_id: String,
    committed: bool,
}

impl PendingAnalysis<'_> {
    fn committed(mut self) {
        self.committed = true;
    }
}

impl Drop for PendingAnalysis<'_> {
    fn drop(&mut self) {
        if !self.committed && self.scheduler.cancel(&self.job_id) {
            debug!(analysis_id = %self.job_id, "withdrew analysis job of uncommitted snapshot");
        }
    }
}

/// Builds and schedules monitor poll jobs.
///
/// Cloning is cheap; every clone shares the engine, repository, fetcher and
/// analyzer.
#[derive(Clone)]
pub struct MonitorPipeline {
    scheduler: SchedulerEngine,
    repository: Arc<dyn MonitorRepository>,
    fetcher: Arc<dyn ContentFetcher>,
    analyzer: Arc<dyn Analyzer>,
    hooks: Arc<dyn JobHooks>,
    config: PipelineConfig,
}

impl MonitorPipeline {
    /// Create a pipeline with the heuristic analyzer, no hooks and default config.
    pub fn new(
        scheduler: SchedulerEngine,
        repository: Arc<dyn MonitorRepository>,
        fetcher: Arc<dyn ContentFetcher>,
    ) -> Self {
        Self {
            scheduler,
            repository,
            fetcher,
            analyzer: Arc::new(HeuristicAnalyzer),
            hooks: Arc::new(NoopHooks),
            config: PipelineConfig::default(),
        }
    }

    /// Create a pipeline that fetches over HTTP with `config.fetch_timeout`.
    pub fn with_http(
        scheduler: SchedulerEngine,
        repository: Arc<dyn MonitorRepository>,
        config: PipelineConfig,
    ) -> Result<Self, MonitorError> {
        let fetcher = HttpFetcher::new(config.fetch_timeout)?;
        Ok(Self::new(scheduler, repository, Arc::new(fetcher)).with_config(config))
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn Analyzer>) -> Self {
        self.analyzer = analyzer;
        self
    }

    /// Attach hooks to every job the pipeline builds.
    pub fn with_hooks(mut self, hooks: Arc<dyn JobHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn scheduler(&self) -> &SchedulerEngine {
        &self.scheduler
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Build the poll job for a monitor. Each execution stores one snapshot
    /// and returns it.
    pub fn build_monitor_job(&self, monitor_id: &str, url: &str) -> Arc<Job<MonitorSnapshot>> {
        let pipeline = self.clone();
        let monitor_id = monitor_id.to_string();
        let url = url.to_string();

        let job = Job::new(monitor_job_id(&monitor_id), move || {
            let pipeline = pipeline.clone();
            let monitor_id = monitor_id.clone();
            let url = url.clone();
            async move { Ok::<_, HandlerError>(pipeline.poll(&monitor_id, &url).await?) }
        })
        .with_max_retries(self.config.fetch_retries)
        .with_retry_backoff(self.config.fetch_backoff)
        .with_hooks(Arc::clone(&self.hooks));

        Arc::new(job)
    }

    /// Poll a monitor once, outside the engine's run loop.
    ///
    /// The analysis job is still enqueued on the engine.
    pub async fn run_once(&self, monitor_id: &str, url: &str) -> Result<MonitorSnapshot, MonitorError> {
        let job = self.build_monitor_job(monitor_id, url);
        Ok(job.execute().await?)
    }

    /// Poll a monitor now and then every `interval` after each poll completes.
    ///
    /// Scheduling a monitor id that is already scheduled replaces it.
    pub fn schedule_monitor(
        &self,
        monitor_id: &str,
        url: &str,
        interval: Duration,
    ) -> Arc<Job<MonitorSnapshot>> {
        let job = self.build_monitor_job(monitor_id, url);
        self.scheduler.schedule_recurring(Arc::clone(&job), interval);
        info!(monitor_id, url, ?interval, "scheduled monitor");
        job
    }

    /// Stop polling a monitor. Returns whether it was scheduled.
    pub fn unschedule_monitor(&self, monitor_id: &str) -> bool {
        self.scheduler.cancel(&monitor_job_id(monitor_id))
    }

    /// One poll: fetch, diff against the latest snapshot, then store the new
    /// snapshot and enqueue its analysis as one unit.
    #[tracing::instrument(skip(self))]
    async fn poll(&self, monitor_id: &str, url: &str) -> Result<MonitorSnapshot, MonitorError> {
        let fetched = self.fetcher.fetch(url).await?;

        let mut tx = self.repository.transaction().await?;
        let latest = tx.get_latest_snapshot(monitor_id).await?;
        let diff = diff_hashes(
            latest.as_ref().map(|s| s.content_hash.as_str()),
            &fetched.content_hash,
        );
        let previous_content = latest.map(|s| s.content);

        let snapshot = MonitorSnapshot::from_fetch(monitor_id, fetched, &diff);
        tx.save_snapshot(snapshot.clone()).await?;

        // Dropped without being marked committed (commit error, or the poll
        // cancelled mid-commit) it takes the analysis job back off the queue.
        let pending = PendingAnalysis {
            scheduler: &self.scheduler,
            job_id: self.enqueue_analysis(url, previous_content, &snapshot),
            committed: false,
        };
        if let Err(e) = tx.commit().await {
            warn!(error = %e, analysis_id = %pending.job_id, "commit failed, withdrawing analysis job");
            return Err(e);
        }
        pending.committed();

        info!(
            has_changed = snapshot.has_changed,
            hash = %snapshot.content_hash,
            "stored monitor snapshot"
        );
        Ok(snapshot)
    }

    fn enqueue_analysis(
        &self,
        url: &str,
        previous_content: Option<String>,
        snapshot: &MonitorSnapshot,
    ) -> String {
        let repository = Arc::clone(&self.repository);
        let analyzer = Arc::clone(&self.analyzer);
        let monitor_id = snapshot.monitor_id.clone();
        let content_hash = snapshot.content_hash.clone();
        let current_content = snapshot.content.clone();
        let url = url.to_string();
        let job_id = analysis_job_id(&monitor_id, &content_hash);

        let job = Job::new(job_id.clone(), move || {
            let repository = Arc::clone(&repository);
            let analyzer = Arc::clone(&analyzer);
            let monitor_id = monitor_id.clone();
            let content_hash = content_hash.clone();
            let current_content = current_content.clone();
            let previous_content = previous_content.clone();
            let url = url.clone();
            async move {
                let analysis =
                    analyzer.analyze(&url, previous_content.as_deref(), &current_content);
                let mut tx = repository.transaction().await?;
                tx.save_analysis(&monitor_id, &content_hash, analysis).await?;
                tx.commit().await?;
                debug!(monitor_id = %monitor_id, hash = %content_hash, "stored analysis");
                Ok::<_, HandlerError>(())
            }
        })
        .with_max_retries(self.config.analysis_retries)
        .with_retry_backoff(self.config.analysis_backoff)
        .with_hooks(Arc::clone(&self.hooks));

        self.scheduler.schedule_once(Arc::new(job), Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryMonitorRepository, MonitorFetchResult, MonitorTransaction};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use webintel_scheduler::{JobError, JobState};

    /// Serves scripted bodies in order; `None` entries fail the fetch.
    /// Repeats the last entry once the script runs out.
    struct ScriptedFetcher {
        script: Mutex<VecDeque<Option<&'static str>>>,
        calls: AtomicU32,
    }

    impl ScriptedFetcher {
        fn new(script: &[Option<&'static str>]) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.iter().copied().collect()),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl ContentFetcher for ScriptedFetcher {
        async fn fetch(&self, url: &str) -> Result<MonitorFetchResult, MonitorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = {
                let mut script = self.script.lock();
                if script.len() > 1 {
                    script.pop_front().flatten()
                } else {
                    script.front().copied().flatten()
                }
            };
            match next {
                Some(body) => Ok(MonitorFetchResult::new(url, 200, body.to_string())),
                None => Err(MonitorError::Status {
                    url: url.to_string(),
                    status: 503,
                }),
            }
        }
    }

    /// Repository whose commits always fail.
    struct BrokenRepository;

    struct BrokenTransaction;

    #[async_trait]
    impl MonitorRepository for BrokenRepository {
        async fn transaction<'a>(
            &'a self,
        ) -> Result<Box<dyn MonitorTransaction + 'a>, MonitorError> {
            Ok(Box::new(BrokenTransaction))
        }
    }

    #[async_trait]
    impl MonitorTransaction for BrokenTransaction {
        async fn get_latest_snapshot(
            &mut self,
            _monitor_id: &str,
        ) -> Result<Option<MonitorSnapshot>, MonitorError> {
            Ok(None)
        }

        async fn save_snapshot(&mut self, _snapshot: MonitorSnapshot) -> Result<(), MonitorError> {
            Ok(())
        }

        async fn save_analysis(
            &mut self,
            _monitor_id: &str,
            _content_hash: &str,
            _analysis: crate::AnalysisOutput,
        ) -> Result<(), MonitorError> {
            Ok(())
        }

        async fn commit(self: Box<Self>) -> Result<(), MonitorError> {
            Err(MonitorError::Repository("disk full".to_string()))
        }
    }

    /// Wraps the in-memory repository with a commit that takes a while.
    struct SlowCommitRepository {
        inner: InMemoryMonitorRepository,
        delay: Duration,
    }

    struct SlowCommitTransaction<'a> {
        inner: Box<dyn MonitorTransaction + 'a>,
        delay: Duration,
    }

    #[async_trait]
    impl MonitorRepository for SlowCommitRepository {
        async fn transaction<'a>(
            &'a self,
        ) -> Result<Box<dyn MonitorTransaction + 'a>, MonitorError> {
            Ok(Box::new(SlowCommitTransaction {
                inner: self.inner.transaction().await?,
                delay: self.delay,
            }))
        }
    }

    #[async_trait]
    impl MonitorTransaction for SlowCommitTransaction<'_> {
        async fn get_latest_snapshot(
            &mut self,
            monitor_id: &str,
        ) -> Result<Option<MonitorSnapshot>, MonitorError> {
            self.inner.get_latest_snapshot(monitor_id).await
        }

        async fn save_snapshot(&mut self, snapshot: MonitorSnapshot) -> Result<(), MonitorError> {
            self.inner.save_snapshot(snapshot).await
        }

        async fn save_analysis(
            &mut self,
            monitor_id: &str,
            content_hash: &str,
            analysis: crate::AnalysisOutput,
        ) -> Result<(), MonitorError> {
            self.inner.save_analysis(monitor_id, content_hash, analysis).await
        }

        async fn commit(self: Box<Self>) -> Result<(), MonitorError> {
            tokio::time::sleep(self.delay).await;
            self.inner.commit().await
        }
    }

    const URL: &str = "https://example.com/status";

    fn pipeline(
        fetcher: Arc<ScriptedFetcher>,
    ) -> (MonitorPipeline, InMemoryMonitorRepository) {
        let repo = InMemoryMonitorRepository::new();
        let pipeline = MonitorPipeline::new(SchedulerEngine::new(), Arc::new(repo.clone()), fetcher);
        (pipeline, repo)
    }

    #[test]
    fn test_job_ids() {
        assert_eq!(monitor_job_id("m1"), "monitor:m1");
        assert_eq!(
            analysis_job_id("m1", "0123456789abcdef0123"),
            "analysis:m1:0123456789ab"
        );
        assert_eq!(analysis_job_id("m1", "abc"), "analysis:m1:abc");
    }

    #[test]
    fn test_build_monitor_job_uses_config() {
        let config = PipelineConfig {
            fetch_retries: 3,
            fetch_backoff: Duration::from_secs(2),
            ..PipelineConfig::default()
        };
        let (pipeline, _repo) = pipeline(ScriptedFetcher::new(&[Some("A")]));
        let pipeline = pipeline.with_config(config);

        let job = pipeline.build_monitor_job("m1", URL);
        assert_eq!(job.id(), "monitor:m1");
        assert_eq!(job.max_retries(), 3);
        assert_eq!(job.retry_backoff(), Duration::from_secs(2));
        assert_eq!(job.state(), JobState::Pending);
    }

    #[tokio::test]
    async fn test_change_sequence_and_analysis_dedup() {
        let fetcher = ScriptedFetcher::new(&[Some("A"), Some("A"), Some("B")]);
        let (pipeline, repo) = pipeline(fetcher);

        let mut flags = Vec::new();
        for _ in 0..3 {
            flags.push(pipeline.run_once("m1", URL).await.unwrap().has_changed);
        }
        assert_eq!(flags, vec![false, false, true]);

        let snapshots = repo.snapshots("m1").await;
        assert_eq!(snapshots.len(), 3);
        let hash_a = snapshots[0].content_hash.clone();
        let hash_b = snapshots[2].content_hash.clone();
        assert_eq!(snapshots[1].content_hash, hash_a);
        assert_ne!(hash_a, hash_b);

        let pending: Vec<String> = pipeline
            .scheduler()
            .list_jobs()
            .into_iter()
            .map(|job| job.id)
            .collect();
        let mut expected = vec![
            analysis_job_id("m1", &hash_a),
            analysis_job_id("m1", &hash_b),
        ];
        expected.sort();
        assert_eq!(pending, expected);

        let engine = pipeline.scheduler().clone();
        let handle = engine.spawn();
        for _ in 0..100 {
            if repo.analysis_count().await == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        engine.stop();
        handle.await.unwrap();

        let first = repo.analysis("m1", &hash_a).await.unwrap();
        assert_eq!(first.detected_changes, vec!["no_textual_change"]);
        let changed = repo.analysis("m1", &hash_b).await.unwrap();
        assert_eq!(changed.detected_changes, vec!["content_changed"]);
    }

    #[tokio::test]
    async fn test_first_poll_analysis_is_initial_capture() {
        let (pipeline, repo) = pipeline(ScriptedFetcher::new(&[Some("hello")]));
        let snapshot = pipeline.run_once("m1", URL).await.unwrap();
        assert!(!snapshot.has_changed);
        assert_eq!(snapshot.monitor_id, "m1");
        assert_eq!(snapshot.url, URL);

        let engine = pipeline.scheduler().clone();
        let handle = engine.spawn();
        for _ in 0..100 {
            if repo.analysis_count().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        engine.stop();
        handle.await.unwrap();

        let analysis = repo.analysis("m1", &snapshot.content_hash).await.unwrap();
        assert_eq!(analysis.detected_changes, vec!["initial_capture"]);
        assert!(analysis.summary.contains(URL));
    }

    #[tokio::test]
    async fn test_fetch_failure_persists_nothing() {
        let (pipeline, repo) = pipeline(ScriptedFetcher::new(&[None]));

        let err = pipeline.run_once("m1", URL).await.unwrap_err();
        match err {
            MonitorError::Job(JobError::Failed {
                job_id, attempts, ..
            }) => {
                assert_eq!(job_id, "monitor:m1");
                assert_eq!(attempts, 1);
            }
            other => panic!("expected job failure, got {other:?}"),
        }
        assert!(repo.snapshots("m1").await.is_empty());
        assert!(pipeline.scheduler().list_jobs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_retries_within_one_poll() {
        let fetcher = ScriptedFetcher::new(&[None, Some("A")]);
        let (pipeline, repo) = pipeline(Arc::clone(&fetcher));
        let pipeline = pipeline.with_config(PipelineConfig {
            fetch_retries: 2,
            fetch_backoff: Duration::from_secs(1),
            ..PipelineConfig::default()
        });

        let job = pipeline.build_monitor_job("m1", URL);
        let snapshot = job.execute().await.unwrap();

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
        assert_eq!(job.attempts(), 2);
        assert_eq!(job.state(), JobState::Succeeded);
        assert_eq!(repo.snapshots("m1").await, vec![snapshot]);
    }

    #[tokio::test]
    async fn test_commit_failure_withdraws_analysis() {
        let pipeline = MonitorPipeline::new(
            SchedulerEngine::new(),
            Arc::new(BrokenRepository),
            ScriptedFetcher::new(&[Some("A")]),
        );

        let err = pipeline.run_once("m1", URL).await.unwrap_err();
        assert!(matches!(err, MonitorError::Job(JobError::Failed { .. })));
        assert!(err.to_string().contains("disk full"));
        assert!(pipeline.scheduler().list_jobs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_monitor_polls_each_interval() {
        let (pipeline, repo) = pipeline(ScriptedFetcher::new(&[Some("A")]));
        let engine = pipeline.scheduler().clone();

        let job = pipeline.schedule_monitor("m1", URL, Duration::from_secs(60));
        assert_eq!(job.id(), "monitor:m1");
        let handle = engine.spawn();

        tokio::time::sleep(Duration::from_secs(150)).await;
        assert_eq!(repo.snapshots("m1").await.len(), 3);
        assert_eq!(repo.analysis_count().await, 1);

        assert!(pipeline.unschedule_monitor("m1"));
        assert!(!pipeline.unschedule_monitor("m1"));
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(repo.snapshots("m1").await.len(), 3);

        engine.stop();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_commit_withdraws_analysis() {
        let repo = InMemoryMonitorRepository::new();
        let slow = SlowCommitRepository {
            inner: repo.clone(),
            delay: Duration::from_secs(1),
        };
        let pipeline = MonitorPipeline::new(
            SchedulerEngine::new(),
            Arc::new(slow),
            ScriptedFetcher::new(&[Some("A")]),
        );
        let engine = pipeline.scheduler().clone();
        let handle = engine.spawn();

        let job = pipeline.build_monitor_job("m1", URL);
        let running = Arc::clone(&job);
        let poll = tokio::spawn(async move { running.execute().await });

        tokio::time::sleep(Duration::from_millis(500)).await;
        job.cancel();
        let result = poll.await.unwrap();
        assert!(matches!(result, Err(JobError::Cancelled { .. })));
        assert!(pipeline.scheduler().list_jobs().is_empty());

        tokio::time::sleep(Duration::from_secs(5)).await;
        engine.stop();
        handle.await.unwrap();

        assert!(repo.snapshots("m1").await.is_empty());
        assert_eq!(repo.analysis_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_commit_keeps_analysis() {
        let repo = InMemoryMonitorRepository::new();
        let slow = SlowCommitRepository {
            inner: repo.clone(),
            delay: Duration::from_secs(1),
        };
        let pipeline = MonitorPipeline::new(
            SchedulerEngine::new(),
            Arc::new(slow),
            ScriptedFetcher::new(&[Some("A")]),
        );
        let engine = pipeline.scheduler().clone();
        let handle = engine.spawn();

        let snapshot = pipeline.run_once("m1", URL).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        engine.stop();
        handle.await.unwrap();

        assert_eq!(repo.snapshots("m1").await, vec![snapshot.clone()]);
        assert!(repo.analysis("m1", &snapshot.content_hash).await.is_some());
    }
}
