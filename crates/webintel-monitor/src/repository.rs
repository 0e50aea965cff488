//! Snapshot and analysis persistence.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::{AnalysisOutput, MonitorError, MonitorSnapshot};

/// Storage for snapshots and analyses.
///
/// All writes go through a [`MonitorTransaction`]. Transactions are
/// serialized: while one is open, no other can begin.
#[async_trait]
pub trait MonitorRepository: Send + Sync {
    /// Begin a transaction.
    async fn transaction<'a>(&'a self) -> Result<Box<dyn MonitorTransaction + 'a>, MonitorError>;

    /// Most recent snapshot of a monitor, read in its own transaction.
    async fn get_latest_snapshot(
        &self,
        monitor_id: &str,
    ) -> Result<Option<MonitorSnapshot>, MonitorError> {
        let mut tx = self.transaction().await?;
        tx.get_latest_snapshot(monitor_id).await
    }
}

/// An open transaction.
///
/// Writes are staged and become visible to other transactions only on
/// [`commit`](MonitorTransaction::commit). Dropping the handle without
/// committing discards them.
#[async_trait]
pub trait MonitorTransaction: Send {
    /// Most recent snapshot of a monitor, including writes staged here.
    async fn get_latest_snapshot(
        &mut self,
        monitor_id: &str,
    ) -> Result<Option<MonitorSnapshot>, MonitorError>;

    async fn save_snapshot(&mut self, snapshot: MonitorSnapshot) -> Result<(), MonitorError>;

    /// Store the analysis for a content fingerprint, replacing any earlier one.
    async fn save_analysis(
        &mut self,
        monitor_id: &str,
        content_hash: &str,
        analysis: AnalysisOutput,
    ) -> Result<(), MonitorError>;

    async fn commit(self: Box<Self>) -> Result<(), MonitorError>;
}

#[derive(Debug, Default)]
struct MemoryStore {
    snapshots: HashMap<String, Vec<MonitorSnapshot>>,
    analyses: HashMap<(String, String), AnalysisOutput>,
}

#[derive(Debug)]
enum StagedWrite {
    Snapshot(MonitorSnapshot),
    Analysis {
        monitor_id: String,
        content_hash: String,
        analysis: AnalysisOutput,
    },
}

/// Process-local repository.
///
/// The store sits behind one async mutex that a transaction holds from begin
/// to commit or drop, which makes it the global transaction lock. Clones
/// share the same store.
#[derive(Debug, Default, Clone)]
pub struct InMemoryMonitorRepository {
    store: Arc<Mutex<MemoryStore>>,
}

impl InMemoryMonitorRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// All committed snapshots of a monitor, oldest first.
    pub async fn snapshots(&self, monitor_id: &str) -> Vec<MonitorSnapshot> {
        let store = self.store.lock().await;
        store.snapshots.get(monitor_id).cloned().unwrap_or_default()
    }

    /// Committed analysis for a monitor's content fingerprint.
    pub async fn analysis(&self, monitor_id: &str, content_hash: &str) -> Option<AnalysisOutput> {
        let store = self.store.lock().await;
        store
            .analyses
            .get(&(monitor_id.to_string(), content_hash.to_string()))
            .cloned()
    }

    /// Number of committed analyses across all monitors.
    pub async fn analysis_count(&self) -> usize {
        self.store.lock().await.analyses.len()
    }
}

#[async_trait]
impl MonitorRepository for InMemoryMonitorRepository {
    async fn transaction<'a>(&'a self) -> Result<Box<dyn MonitorTransaction + 'a>, MonitorError> {
        let store = self.store.lock().await;
        Ok(Box::new(InMemoryTransaction {
            store,
            staged: Vec::new(),
        }))
    }
}

/// Transaction over [`InMemoryMonitorRepository`]. Holds the store lock.
pub struct InMemoryTransaction<'a> {
    store: MutexGuard<'a, MemoryStore>,
    staged: Vec<StagedWrite>,
}

#[async_trait]
impl MonitorTransaction for InMemoryTransaction<'_> {
    async fn get_latest_snapshot(
        &mut self,
        monitor_id: &str,
    ) -> Result<Option<MonitorSnapshot>, MonitorError> {
        let staged = self.staged.iter().rev().find_map(|write| match write {
            StagedWrite::Snapshot(snapshot) if snapshot.monitor_id == monitor_id => {
                Some(snapshot.clone())
            }
            _ => None,
        });
        if staged.is_some() {
            return Ok(staged);
        }

        Ok(self
            .store
            .snapshots
            .get(monitor_id)
            .and_then(|history| history.last())
            .cloned())
    }

    async fn save_snapshot(&mut self, snapshot: MonitorSnapshot) -> Result<(), MonitorError> {
        self.staged.push(StagedWrite::Snapshot(snapshot));
        Ok(())
    }

    async fn save_analysis(
        &mut self,
        monitor_id: &str,
        content_hash: &str,
        analysis: AnalysisOutput,
    ) -> Result<(), MonitorError> {
        self.staged.push(StagedWrite::Analysis {
            monitor_id: monitor_id.to_string(),
            content_hash: content_hash.to_string(),
            analysis,
        });
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), MonitorError> {
        let writes: Vec<StagedWrite> = self.staged.drain(..).collect();
        let count = writes.len();

        for write in writes {
            match write {
                StagedWrite::Snapshot(snapshot) => {
                    self.store
                        .snapshots
                        .entry(snapshot.monitor_id.clone())
                        .or_default()
                        .push(snapshot);
                }
                StagedWrite::Analysis {
                    monitor_id,
                    content_hash,
                    analysis,
                } => {
                    self.store
                        .analyses
                        .insert((monitor_id, content_hash), analysis);
                }
            }
        }

        debug!(writes = count, "committed transaction");
        Ok(())
    }
}

impl Drop for InMemoryTransaction<'_> {
    fn drop(&mut self) {
        if !self.staged.is_empty() {
            debug!(
                writes = self.staged.len(),
                "rolling back uncommitted transaction"
            );
        }
    }
}
