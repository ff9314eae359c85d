//! Nightly housekeeping.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::info;

use crate::error::WorkerError;
use crate::store::Store;
use crate::worker::base::Worker;
use crate::worker::monitor::WorkerMonitor;

#[derive(Debug, Clone, Serialize)]
pub struct CleanupOutput {
    pub sync_logs_removed: usize,
    pub cutoff: DateTime<Utc>,
}

/// Prunes sync logs past the retention window.
pub struct CleanupWorker {
    store: Arc<dyn Store>,
    retention_days: u32,
    monitor: Arc<WorkerMonitor>,
}

impl CleanupWorker {
    pub const NAME: &'static str = "nightly_cleanup";

    pub fn new(store: Arc<dyn Store>, retention_days: u32, monitor: Arc<WorkerMonitor>) -> Self {
        Self {
            store,
            retention_days,
            monitor,
        }
    }
}

#[async_trait]
impl Worker for CleanupWorker {
    type Args = ();
    type Output = CleanupOutput;

    fn name(&self) -> &str {
        Self::NAME
    }

    fn monitor(&self) -> &WorkerMonitor {
        &self.monitor
    }

    async fn execute(&self, _args: ()) -> Result<CleanupOutput, WorkerError> {
        let cutoff = Utc::now() - Duration::days(i64::from(self.retention_days));
        let removed = self.store.prune_sync_logs(cutoff).await?;
        info!(removed, cutoff = %cutoff, "Pruned sync logs");
        Ok(CleanupOutput {
            sync_logs_removed: removed,
            cutoff,
        })
    }
}
