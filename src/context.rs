//! Process-wide context.
//!
//! Built once at startup and shared by the scheduler jobs and the HTTP
//! surface. There is exactly one monitor and one scheduler per process, and
//! both live here instead of in globals.

use std::sync::Arc;

use tracing::info;

use crate::ai::{AiOrchestrator, ArtifactService};
use crate::config::AppConfig;
use crate::error::SchedulerError;
use crate::llm::LlmProvider;
use crate::mail::{MailProviderFactory, MailSync, ReplySender, ThreadResolver};
use crate::metrics::MetricsStore;
use crate::store::Store;
use crate::worker::{
    AiProcessingDeps, AiProcessingWorker, BulkAiProcessingArgs, BulkAiProcessingWorker,
    BulkEmailSyncArgs, BulkEmailSyncWorker, CleanupWorker, EmailSyncWorker, FnJob, JobInfo,
    Trigger, Worker, WorkerMonitor, WorkerScheduler,
};

pub const EMAIL_SYNC_JOB: &str = "email_sync_job";
pub const AI_PROCESSING_JOB: &str = "ai_processing_job";
pub const CLEANUP_JOB: &str = "nightly_cleanup_job";

pub struct AppContext {
    pub config: AppConfig,
    pub store: Arc<dyn Store>,
    pub monitor: Arc<WorkerMonitor>,
    pub scheduler: Arc<WorkerScheduler>,
    pub mail_sync: Arc<MailSync>,
    pub replies: Arc<ReplySender>,
    pub artifacts: Arc<ArtifactService>,
    pub email_sync: Arc<EmailSyncWorker>,
    pub bulk_email_sync: Arc<BulkEmailSyncWorker>,
    pub ai_processing: Arc<AiProcessingWorker>,
    pub bulk_ai_processing: Arc<BulkAiProcessingWorker>,
    pub cleanup: Arc<CleanupWorker>,
}

impl AppContext {
    pub fn new(
        config: AppConfig,
        store: Arc<dyn Store>,
        metrics: Arc<dyn MetricsStore>,
        llm: Arc<dyn LlmProvider>,
        providers: Arc<dyn MailProviderFactory>,
    ) -> Self {
        let monitor = Arc::new(WorkerMonitor::new(metrics, &config.monitor));
        let scheduler = Arc::new(WorkerScheduler::new(
            config.scheduler.tick,
            config.scheduler.misfire_grace,
        ));

        let mail_sync = Arc::new(MailSync::new(
            Arc::clone(&store),
            Arc::clone(&providers),
            config.sync.clone(),
        ));
        let replies = Arc::new(ReplySender::new(Arc::clone(&store), Arc::clone(&providers)));
        let resolver = Arc::new(ThreadResolver::new(Arc::clone(&store), providers));
        let orchestrator = Arc::new(AiOrchestrator::new(Arc::clone(&store), llm, &config.ai));
        let artifacts = Arc::new(ArtifactService::new(Arc::clone(&store), orchestrator));

        let email_sync = Arc::new(EmailSyncWorker::new(
            Arc::clone(&mail_sync),
            Arc::clone(&monitor),
        ));
        let bulk_email_sync = Arc::new(BulkEmailSyncWorker::new(
            Arc::clone(&store),
            Arc::clone(&mail_sync),
            Arc::clone(&monitor),
        ));
        let ai_processing = Arc::new(AiProcessingWorker::new(AiProcessingDeps {
            store: Arc::clone(&store),
            artifacts: Arc::clone(&artifacts),
            resolver,
            sync: Arc::clone(&mail_sync),
            monitor: Arc::clone(&monitor),
            default_tasks: config.ai.default_tasks.clone(),
            sync_missing_threads: config.sync.sync_missing_threads,
        }));
        let bulk_ai_processing = Arc::new(BulkAiProcessingWorker::new(
            Arc::clone(&store),
            Arc::clone(&ai_processing),
            Arc::clone(&monitor),
        ));
        let cleanup = Arc::new(CleanupWorker::new(
            Arc::clone(&store),
            config.scheduler.sync_log_retention_days,
            Arc::clone(&monitor),
        ));

        Self {
            config,
            store,
            monitor,
            scheduler,
            mail_sync,
            replies,
            artifacts,
            email_sync,
            bulk_email_sync,
            ai_processing,
            bulk_ai_processing,
            cleanup,
        }
    }

    /// Register the periodic jobs enabled in the scheduler config.
    pub async fn register_default_jobs(&self) -> Result<Vec<JobInfo>, SchedulerError> {
        let cfg = &self.config.scheduler;
        let mut registered = Vec::new();

        if cfg.email_sync_enabled {
            let worker = Arc::clone(&self.bulk_email_sync);
            let lookback_days = cfg.scheduled_lookback_days;
            let handler = FnJob(move || {
                let worker = Arc::clone(&worker);
                async move {
                    worker
                        .run(BulkEmailSyncArgs {
                            lookback_days: Some(lookback_days),
                            full_sync: false,
                        })
                        .await;
                }
            });
            registered.push(
                self.scheduler
                    .add_job(
                        EMAIL_SYNC_JOB,
                        "Bulk email sync",
                        Trigger::interval(cfg.email_sync_interval)?,
                        Arc::new(handler),
                    )
                    .await,
            );
        }

        if cfg.ai_processing_enabled {
            let worker = Arc::clone(&self.bulk_ai_processing);
            let limit = cfg.ai_processing_batch_size;
            let handler = FnJob(move || {
                let worker = Arc::clone(&worker);
                async move {
                    worker
                        .run(BulkAiProcessingArgs {
                            user_id: None,
                            limit,
                            tasks: None,
                        })
                        .await;
                }
            });
            registered.push(
                self.scheduler
                    .add_job(
                        AI_PROCESSING_JOB,
                        "Bulk AI processing",
                        Trigger::interval(cfg.ai_processing_interval)?,
                        Arc::new(handler),
                    )
                    .await,
            );
        }

        if cfg.cleanup_enabled {
            let worker = Arc::clone(&self.cleanup);
            let handler = FnJob(move || {
                let worker = Arc::clone(&worker);
                async move {
                    worker.run(()).await;
                }
            });
            registered.push(
                self.scheduler
                    .add_job(
                        CLEANUP_JOB,
                        "Nightly cleanup",
                        Trigger::daily(cfg.cleanup_hour, cfg.cleanup_minute)?,
                        Arc::new(handler),
                    )
                    .await,
            );
        }

        info!(jobs = registered.len(), "Default jobs registered");
        Ok(registered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::metrics::MemoryMetricsStore;
    use crate::store::LibSqlStore;
    use crate::testing::{FakeFactory, ScriptedLlm};

    async fn context(scheduler: SchedulerConfig) -> AppContext {
        let mut config = AppConfig::from_lookup(|_| None).unwrap();
        config.scheduler = scheduler;
        AppContext::new(
            config,
            Arc::new(LibSqlStore::new_memory().await.unwrap()),
            Arc::new(MemoryMetricsStore::new()),
            ScriptedLlm::always("ok"),
            Arc::new(FakeFactory::default()),
        )
    }

    #[tokio::test]
    async fn registers_enabled_jobs_only() {
        let ctx = context(SchedulerConfig::default()).await;
        let jobs = ctx.register_default_jobs().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, CLEANUP_JOB);
        assert_eq!(jobs[0].trigger, "cron[0 0 2 * * *]");
    }

    #[tokio::test]
    async fn registers_all_jobs_when_enabled() {
        let ctx = context(SchedulerConfig {
            email_sync_enabled: true,
            ai_processing_enabled: true,
            ..SchedulerConfig::default()
        })
        .await;
        ctx.register_default_jobs().await.unwrap();

        let ids: Vec<String> = ctx
            .scheduler
            .get_jobs_info()
            .await
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(ids, vec![AI_PROCESSING_JOB, EMAIL_SYNC_JOB, CLEANUP_JOB]);
    }
}
