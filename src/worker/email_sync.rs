//! Mail sync workers: one user on demand, or every connected user on a schedule.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::WorkerError;
use crate::mail::{MailSync, ProviderKind, UserSyncReport};
use crate::store::Store;
use crate::worker::base::Worker;
use crate::worker::monitor::WorkerMonitor;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EmailSyncArgs {
    pub user_id: String,
    #[serde(default)]
    pub provider: Option<ProviderKind>,
    #[serde(default)]
    pub lookback_days: Option<u32>,
    #[serde(default)]
    pub full_sync: bool,
}

/// Syncs the connected accounts of one user.
pub struct EmailSyncWorker {
    sync: Arc<MailSync>,
    monitor: Arc<WorkerMonitor>,
}

impl EmailSyncWorker {
    pub const NAME: &'static str = "email_sync";

    pub fn new(sync: Arc<MailSync>, monitor: Arc<WorkerMonitor>) -> Self {
        Self { sync, monitor }
    }
}

#[async_trait]
impl Worker for EmailSyncWorker {
    type Args = EmailSyncArgs;
    type Output = UserSyncReport;

    fn name(&self) -> &str {
        Self::NAME
    }

    fn monitor(&self) -> &WorkerMonitor {
        &self.monitor
    }

    async fn execute(&self, args: EmailSyncArgs) -> Result<UserSyncReport, WorkerError> {
        if args.user_id.trim().is_empty() {
            return Err(WorkerError::Validation("user_id is required".to_string()));
        }
        let report = self
            .sync
            .sync_user(&args.user_id, args.provider, args.lookback_days, args.full_sync)
            .await?;
        if report.providers.is_empty() && !report.errors.is_empty() {
            return Err(WorkerError::Failed(report.errors.join("; ")));
        }
        Ok(report)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BulkEmailSyncArgs {
    #[serde(default)]
    pub lookback_days: Option<u32>,
    #[serde(default)]
    pub full_sync: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkSyncOutput {
    pub users_synced: u32,
    pub users_failed: u32,
    pub total_emails: u32,
    pub total_threads: u32,
    pub errors: Vec<String>,
}

/// Syncs every user with at least one connected account.
pub struct BulkEmailSyncWorker {
    store: Arc<dyn Store>,
    sync: Arc<MailSync>,
    monitor: Arc<WorkerMonitor>,
}

impl BulkEmailSyncWorker {
    pub const NAME: &'static str = "bulk_email_sync";

    pub fn new(store: Arc<dyn Store>, sync: Arc<MailSync>, monitor: Arc<WorkerMonitor>) -> Self {
        Self {
            store,
            sync,
            monitor,
        }
    }
}

#[async_trait]
impl Worker for BulkEmailSyncWorker {
    type Args = BulkEmailSyncArgs;
    type Output = BulkSyncOutput;

    fn name(&self) -> &str {
        Self::NAME
    }

    fn monitor(&self) -> &WorkerMonitor {
        &self.monitor
    }

    async fn execute(&self, args: BulkEmailSyncArgs) -> Result<BulkSyncOutput, WorkerError> {
        let users = self.store.list_account_users().await?;
        info!(users = users.len(), "Starting bulk email sync");

        let mut out = BulkSyncOutput::default();
        for user_id in &users {
            match self
                .sync
                .sync_user(user_id, None, args.lookback_days, args.full_sync)
                .await
            {
                Ok(report) if report.providers.is_empty() => {
                    out.users_failed += 1;
                    out.errors.extend(report.errors.into_iter().map(|e| format!("{user_id}: {e}")));
                }
                Ok(report) => {
                    out.users_synced += 1;
                    out.total_emails += report.total_emails;
                    out.total_threads += report.total_threads;
                    out.errors.extend(report.errors.into_iter().map(|e| format!("{user_id}: {e}")));
                }
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "User sync failed");
                    out.users_failed += 1;
                    out.errors.push(format!("{user_id}: {e}"));
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{MonitorConfig, SyncConfig};
    use crate::metrics::MemoryMetricsStore;
    use crate::store::LibSqlStore;
    use crate::testing::{FakeFactory, FakeMailbox, account, message};

    use super::*;

    struct Fixture {
        single: EmailSyncWorker,
        bulk: BulkEmailSyncWorker,
        store: Arc<dyn Store>,
        gmail: Arc<FakeMailbox>,
        monitor: Arc<WorkerMonitor>,
    }

    async fn fixture() -> Fixture {
        let store: Arc<dyn Store> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let gmail = FakeMailbox::new(ProviderKind::Gmail);
        let sync = Arc::new(MailSync::new(
            store.clone(),
            Arc::new(FakeFactory::default().with(gmail.clone())),
            SyncConfig::default(),
        ));
        let monitor = Arc::new(WorkerMonitor::new(
            Arc::new(MemoryMetricsStore::new()),
            &MonitorConfig::default(),
        ));
        Fixture {
            single: EmailSyncWorker::new(sync.clone(), monitor.clone()),
            bulk: BulkEmailSyncWorker::new(store.clone(), sync, monitor.clone()),
            store,
            gmail,
            monitor,
        }
    }

    #[tokio::test]
    async fn partial_failure_still_succeeds() {
        let f = fixture().await;
        f.store.upsert_account(&account("u1", ProviderKind::Gmail)).await.unwrap();
        for i in 1..=10 {
            f.gmail.push(message(&format!("m{i}"), "t1", 9, "body"));
        }
        f.gmail.fail_on("m4");

        let envelope = f
            .single
            .run(EmailSyncArgs {
                user_id: "u1".to_string(),
                full_sync: true,
                ..Default::default()
            })
            .await;
        assert!(envelope.is_success());
        let result = envelope.result().unwrap();
        assert_eq!(result["total_emails"], 9);
        assert_eq!(result["providers"]["gmail"]["errors"], 1);

        let stats = f.monitor.get_worker_stats(EmailSyncWorker::NAME).await.unwrap();
        assert_eq!(stats.successful_executions, 1);
    }

    #[tokio::test]
    async fn unconnected_user_fails_inside_envelope() {
        let f = fixture().await;
        let envelope = f
            .single
            .run(EmailSyncArgs {
                user_id: "ghost".to_string(),
                ..Default::default()
            })
            .await;
        assert!(!envelope.is_success());
        assert!(envelope.error().unwrap().contains("no connected"));
    }

    #[tokio::test]
    async fn bulk_sync_counts_users() {
        let f = fixture().await;
        f.store.upsert_account(&account("u1", ProviderKind::Gmail)).await.unwrap();
        f.store.upsert_account(&account("u2", ProviderKind::Outlook)).await.unwrap();
        f.gmail.push(message("m1", "t1", 9, "body"));

        let out = f
            .bulk
            .execute(BulkEmailSyncArgs {
                full_sync: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(out.users_synced, 1);
        // No outlook mailbox is registered with the factory.
        assert_eq!(out.users_failed, 1);
        assert_eq!(out.total_emails, 1);
        assert_eq!(out.errors.len(), 1);
    }
}
