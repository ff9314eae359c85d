//! AI processing workers.
//!
//! [`AiProcessingWorker`] runs a subset of AI tasks for one thread. Each task
//! is isolated: a failing task is reported next to the ones that succeeded,
//! and the job only fails when every requested task failed.
//! [`BulkAiProcessingWorker`] drives the single-thread worker over threads
//! that have no summary yet.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::ai::{AiTask, ArtifactOutput, ArtifactService};
use crate::error::WorkerError;
use crate::mail::{MailSync, Resolution, ResolvedThread, ThreadResolver};
use crate::store::Store;
use crate::worker::base::Worker;
use crate::worker::monitor::WorkerMonitor;

#[derive(Debug, Clone, Deserialize)]
pub struct AiProcessingArgs {
    pub user_id: String,
    /// Internal id, provider thread id or a provider alias.
    pub thread_id: String,
    #[serde(default)]
    pub tasks: Option<Vec<AiTask>>,
    #[serde(default)]
    pub force_regenerate: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TaskOutcome {
    Success { task: AiTask, output: ArtifactOutput },
    Failed { task: AiTask, error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct AiProcessingOutput {
    pub thread_id: Uuid,
    pub provider_thread_id: String,
    pub resolved_via: Resolution,
    pub tasks_succeeded: u32,
    pub tasks_failed: u32,
    pub results: Vec<TaskOutcome>,
}

/// Collaborators of [`AiProcessingWorker`].
pub struct AiProcessingDeps {
    pub store: Arc<dyn Store>,
    pub artifacts: Arc<ArtifactService>,
    pub resolver: Arc<ThreadResolver>,
    pub sync: Arc<MailSync>,
    pub monitor: Arc<WorkerMonitor>,
    pub default_tasks: Vec<AiTask>,
    /// Ask the provider to sync a thread that cannot be resolved locally.
    pub sync_missing_threads: bool,
}

pub struct AiProcessingWorker {
    deps: AiProcessingDeps,
}

impl AiProcessingWorker {
    pub const NAME: &'static str = "ai_processing";

    pub fn new(deps: AiProcessingDeps) -> Self {
        Self { deps }
    }

    async fn resolve(
        &self,
        user_id: &str,
        thread_id: &str,
    ) -> Result<Option<ResolvedThread>, WorkerError> {
        if let Some(resolved) = self.deps.resolver.resolve(user_id, thread_id).await? {
            return Ok(Some(resolved));
        }
        if !self.deps.sync_missing_threads {
            return Ok(None);
        }

        info!(user_id, thread_id, "Thread not stored, syncing from provider");
        for account in self.deps.store.list_accounts(user_id).await? {
            let canonical = match self.deps.sync.sync_thread(&account, thread_id).await {
                Ok(Some(canonical)) => canonical,
                Ok(None) => continue,
                Err(e) => {
                    warn!(user_id, thread_id, provider = %account.provider, error = %e, "Thread sync failed");
                    continue;
                }
            };
            if let Some(thread) = self
                .deps
                .store
                .find_thread(user_id, Some(account.provider), &canonical)
                .await?
            {
                return Ok(Some(ResolvedThread {
                    thread,
                    via: Resolution::Canonical,
                }));
            }
        }
        Ok(None)
    }
}

/// Requested tasks in order, without repeats.
fn dedup_tasks(tasks: Vec<AiTask>) -> Vec<AiTask> {
    let mut unique = Vec::with_capacity(tasks.len());
    for task in tasks {
        if !unique.contains(&task) {
            unique.push(task);
        }
    }
    unique
}

#[async_trait]
impl Worker for AiProcessingWorker {
    type Args = AiProcessingArgs;
    type Output = AiProcessingOutput;

    fn name(&self) -> &str {
        Self::NAME
    }

    fn monitor(&self) -> &WorkerMonitor {
        &self.deps.monitor
    }

    async fn execute(&self, args: AiProcessingArgs) -> Result<AiProcessingOutput, WorkerError> {
        let tasks = dedup_tasks(
            args.tasks
                .unwrap_or_else(|| self.deps.default_tasks.clone()),
        );
        if tasks.is_empty() {
            return Err(WorkerError::Validation("no AI tasks requested".to_string()));
        }

        let resolved = self
            .resolve(&args.user_id, &args.thread_id)
            .await?
            .ok_or_else(|| WorkerError::Validation(format!("Thread not found: {}", args.thread_id)))?;
        let thread = resolved.thread;
        info!(
            thread_id = %thread.id,
            provider_thread_id = %thread.provider_thread_id,
            via = ?resolved.via,
            tasks = ?tasks,
            "Processing thread"
        );

        let mut results = Vec::with_capacity(tasks.len());
        let mut errors = Vec::new();
        for task in &tasks {
            match self
                .deps
                .artifacts
                .process(&args.user_id, thread.id, *task, args.force_regenerate)
                .await
            {
                Ok(output) => results.push(TaskOutcome::Success {
                    task: *task,
                    output,
                }),
                Err(e) => {
                    warn!(thread_id = %thread.id, task = %task, error = %e, "AI task failed");
                    errors.push(format!("{task}: {e}"));
                    results.push(TaskOutcome::Failed {
                        task: *task,
                        error: e.to_string(),
                    });
                }
            }
        }

        if errors.len() == tasks.len() {
            return Err(WorkerError::Failed(format!(
                "all AI tasks failed: {}",
                errors.join("; ")
            )));
        }
        Ok(AiProcessingOutput {
            thread_id: thread.id,
            provider_thread_id: thread.provider_thread_id,
            resolved_via: resolved.via,
            tasks_succeeded: (tasks.len() - errors.len()) as u32,
            tasks_failed: errors.len() as u32,
            results,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkAiProcessingArgs {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default = "default_bulk_limit")]
    pub limit: usize,
    #[serde(default)]
    pub tasks: Option<Vec<AiTask>>,
}

fn default_bulk_limit() -> usize {
    50
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkAiOutput {
    pub threads_processed: u32,
    pub threads_failed: u32,
}

/// Processes threads that have no summary yet, most recent first.
pub struct BulkAiProcessingWorker {
    store: Arc<dyn Store>,
    single: Arc<AiProcessingWorker>,
    monitor: Arc<WorkerMonitor>,
}

impl BulkAiProcessingWorker {
    pub const NAME: &'static str = "bulk_ai_processing";

    pub fn new(
        store: Arc<dyn Store>,
        single: Arc<AiProcessingWorker>,
        monitor: Arc<WorkerMonitor>,
    ) -> Self {
        Self {
            store,
            single,
            monitor,
        }
    }
}

#[async_trait]
impl Worker for BulkAiProcessingWorker {
    type Args = BulkAiProcessingArgs;
    type Output = BulkAiOutput;

    fn name(&self) -> &str {
        Self::NAME
    }

    fn monitor(&self) -> &WorkerMonitor {
        &self.monitor
    }

    async fn execute(&self, args: BulkAiProcessingArgs) -> Result<BulkAiOutput, WorkerError> {
        let threads = self
            .store
            .list_threads_without_summary(args.user_id.as_deref(), args.limit)
            .await?;
        info!(count = threads.len(), "Starting bulk AI processing");

        let mut out = BulkAiOutput::default();
        for thread in threads {
            let envelope = self
                .single
                .run(AiProcessingArgs {
                    user_id: thread.user_id,
                    thread_id: thread.id.to_string(),
                    tasks: args.tasks.clone(),
                    force_regenerate: false,
                })
                .await;
            if envelope.is_success() {
                out.threads_processed += 1;
            } else {
                out.threads_failed += 1;
            }
        }
        Ok(out)
    }
}
