//! Daemon command for running WebIntel's monitoring loop.
//!
//! Every configured monitor is scheduled as a recurring job on one
//! [`SchedulerEngine`]. The engine runs until Ctrl-C, at which point it is
//! stopped, in-flight polls are cancelled, and a per-monitor summary is
//! logged.

use std::collections::HashSet;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use miette::Result;
use thiserror::Error;
use tracing::{info, warn};

use webintel_monitor::{InMemoryMonitorRepository, MonitorPipeline, PipelineConfig};
use webintel_scheduler::SchedulerEngine;

use crate::hooks::TracingHooks;

/// Default poll interval in seconds.
pub const DEFAULT_INTERVAL_SECS: u64 = 300;

/// A monitor given on the command line as `ID=URL`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorSpec {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MonitorSpecError {
    #[error("expected ID=URL, got '{0}'")]
    MissingSeparator(String),

    #[error("monitor id must be non-empty and contain no whitespace, got '{0}'")]
    InvalidId(String),

    #[error("monitor '{0}' has an empty URL")]
    EmptyUrl(String),
}

impl FromStr for MonitorSpec {
    type Err = MonitorSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, url) = s
            .split_once('=')
            .ok_or_else(|| MonitorSpecError::MissingSeparator(s.to_string()))?;
        let (id, url) = (id.trim(), url.trim());

        if id.is_empty() || id.chars().any(char::is_whitespace) {
            return Err(MonitorSpecError::InvalidId(id.to_string()));
        }
        if url.is_empty() {
            return Err(MonitorSpecError::EmptyUrl(id.to_string()));
        }

        Ok(Self {
            id: id.to_string(),
            url: url.to_string(),
        })
    }
}

/// Configuration for the daemon.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub monitors: Vec<MonitorSpec>,
    /// Delay between the end of one poll and the start of the next.
    pub interval: Duration,
    pub pipeline: PipelineConfig,
}

impl DaemonConfig {
    fn validate(&self) -> Result<()> {
        if self.monitors.is_empty() {
            return Err(miette::miette!(
                "no monitors configured, pass --monitor ID=URL or set WEBINTEL_MONITORS"
            ));
        }
        if self.interval.is_zero() {
            return Err(miette::miette!("--interval must be at least one second"));
        }

        let mut seen = HashSet::new();
        for monitor in &self.monitors {
            if !seen.insert(monitor.id.as_str()) {
                return Err(miette::miette!("duplicate monitor id '{}'", monitor.id));
            }
        }
        Ok(())
    }
}

/// Run the daemon until Ctrl-C.
pub async fn run(config: DaemonConfig) -> Result<()> {
    let repository = InMemoryMonitorRepository::new();
    run_until(config, repository, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    })
    .await
}

/// Run the daemon until `shutdown` resolves.
pub async fn run_until<F>(
    config: DaemonConfig,
    repository: InMemoryMonitorRepository,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()>,
{
    config.validate()?;
    info!(
        monitors = config.monitors.len(),
        interval_secs = config.interval.as_secs(),
        "starting WebIntel daemon"
    );

    let engine = SchedulerEngine::new();
    let pipeline = MonitorPipeline::with_http(
        engine.clone(),
        Arc::new(repository.clone()),
        config.pipeline.clone(),
    )
    .map_err(|e| miette::miette!("failed to create HTTP fetcher: {}", e))?
    .with_hooks(Arc::new(TracingHooks));

    for monitor in &config.monitors {
        pipeline.schedule_monitor(&monitor.id, &monitor.url, config.interval);
    }

    let scheduler_handle = engine.spawn();

    shutdown.await;
    info!("received shutdown signal");
    engine.stop();
    scheduler_handle
        .await
        .map_err(|e| miette::miette!("scheduler task failed: {}", e))?;

    for monitor in &config.monitors {
        let snapshots = repository.snapshots(&monitor.id).await;
        let changes = snapshots.iter().filter(|s| s.has_changed).count();
        info!(
            monitor_id = %monitor.id,
            snapshots = snapshots.len(),
            changes,
            latest_hash = snapshots.last().map(|s| s.content_hash.as_str()),
            "monitor summary"
        );
    }

    info!("WebIntel daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(monitors: Vec<MonitorSpec>) -> DaemonConfig {
        DaemonConfig {
            monitors,
            interval: Duration::from_secs(DEFAULT_INTERVAL_SECS),
            pipeline: PipelineConfig::default(),
        }
    }

    fn spec(id: &str, url: &str) -> MonitorSpec {
        MonitorSpec {
            id: id.to_string(),
            url: url.to_string(),
        }
    }

    #[test]
    fn test_monitor_spec_parse() {
        let parsed: MonitorSpec = "docs=https://example.com/a?b=c".parse().unwrap();
        assert_eq!(parsed, spec("docs", "https://example.com/a?b=c"));

        let padded: MonitorSpec = " docs = https://example.com ".parse().unwrap();
        assert_eq!(padded, spec("docs", "https://example.com"));
    }

    #[test]
    fn test_monitor_spec_errors() {
        assert_eq!(
            "https://example.com".parse::<MonitorSpec>(),
            Err(MonitorSpecError::MissingSeparator(
                "https://example.com".to_string()
            ))
        );
        assert!(matches!(
            "=https://example.com".parse::<MonitorSpec>(),
            Err(MonitorSpecError::InvalidId(_))
        ));
        assert!(matches!(
            "my docs=https://example.com".parse::<MonitorSpec>(),
            Err(MonitorSpecError::InvalidId(_))
        ));
        assert_eq!(
            "docs=".parse::<MonitorSpec>(),
            Err(MonitorSpecError::EmptyUrl("docs".to_string()))
        );
    }

    #[test]
    fn test_validate() {
        assert!(config(Vec::new()).validate().is_err());
        assert!(
            config(vec![spec("a", "https://a"), spec("a", "https://b")])
                .validate()
                .is_err()
        );

        let mut zero = config(vec![spec("a", "https://a")]);
        zero.interval = Duration::ZERO;
        assert!(zero.validate().is_err());

        assert!(config(vec![spec("a", "https://a"), spec("b", "https://b")])
            .validate()
            .is_ok());
    }

    #[tokio::test]
    async fn test_run_until_polls_each_monitor() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/one"))
            .respond_with(ResponseTemplate::new(200).set_body_string("first page"))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/two"))
            .respond_with(ResponseTemplate::new(200).set_body_string("second page"))
            .mount(&mock_server)
            .await;

        let repository = InMemoryMonitorRepository::new();
        let config = config(vec![
            spec("one", &format!("{}/one", mock_server.uri())),
            spec("two", &format!("{}/two", mock_server.uri())),
        ]);

        let observer = repository.clone();
        let shutdown = async move {
            for _ in 0..200 {
                if observer.analysis_count().await == 2 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        run_until(config, repository.clone(), shutdown).await.unwrap();

        assert_eq!(repository.snapshots("one").await.len(), 1);
        assert_eq!(repository.snapshots("two").await.len(), 1);
        assert_eq!(repository.analysis_count().await, 2);
    }

    #[tokio::test]
    async fn test_run_until_rejects_empty_config() {
        let result = run_until(config(Vec::new()), InMemoryMonitorRepository::new(), async {}).await;
        assert!(result.is_err());
    }
}
