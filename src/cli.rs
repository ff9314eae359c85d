//! Command-line surface.
//!
//! With no subcommand the binary serves the scheduler and HTTP API. The
//! `worker` subcommands run one operation against the same [`AppContext`]
//! and print its result as JSON.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use serde_json::{Value, json};

use crate::ai::AiTask;
use crate::context::AppContext;
use crate::mail::ProviderKind;
use crate::worker::monitor::DEFAULT_HISTORY_LIMIT;
use crate::worker::{
    AiProcessingArgs, BulkAiProcessingArgs, BulkEmailSyncArgs, EmailSyncArgs, Worker,
};

/// Lookback used by the sync commands when none is given.
const DEFAULT_LOOKBACK_DAYS: u32 = 7;

#[derive(Parser, Debug)]
#[command(name = "inbox-workers", version, about = "Mail sync and AI processing workers")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the scheduler and the HTTP API (default)
    Serve,
    /// Run one worker operation and print the result
    Worker {
        #[command(subcommand)]
        command: WorkerCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum WorkerCommand {
    /// Scheduler control
    Scheduler {
        #[command(subcommand)]
        action: SchedulerAction,
    },
    /// Mail sync
    Sync {
        #[command(subcommand)]
        action: SyncAction,
    },
    /// AI thread processing
    Ai {
        #[command(subcommand)]
        action: AiAction,
    },
    /// Execution statistics
    Monitor {
        #[command(subcommand)]
        action: MonitorAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum SchedulerAction {
    /// Run the scheduler in the foreground until interrupted
    Start,
    /// Stop the scheduler, waiting for in-flight runs
    Stop,
    /// Show whether the scheduler runs and its jobs
    Status,
    Pause { job_id: String },
    Resume { job_id: String },
    Remove { job_id: String },
}

#[derive(Subcommand, Debug)]
pub enum SyncAction {
    /// Sync one user's connected accounts
    User {
        #[arg(long)]
        user_id: String,
        /// gmail or outlook; all connected providers when omitted
        #[arg(long)]
        provider: Option<String>,
        /// List without a date filter
        #[arg(long)]
        full: bool,
        #[arg(long, default_value_t = DEFAULT_LOOKBACK_DAYS)]
        lookback_days: u32,
    },
    /// Sync every user with a connected account
    All {
        #[arg(long, default_value_t = DEFAULT_LOOKBACK_DAYS)]
        lookback_days: u32,
    },
}

#[derive(Subcommand, Debug)]
pub enum AiAction {
    /// Process one thread
    Thread {
        #[arg(long)]
        user_id: String,
        /// Internal id, provider thread id or alias
        #[arg(long)]
        thread_id: String,
        #[arg(long = "tasks", value_delimiter = ',')]
        tasks: Vec<AiTask>,
        #[arg(long)]
        force: bool,
    },
    /// Process threads that have no summary yet
    Bulk {
        #[arg(long)]
        user_id: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
        #[arg(long = "tasks", value_delimiter = ',')]
        tasks: Vec<AiTask>,
    },
}

#[derive(Subcommand, Debug)]
pub enum MonitorAction {
    /// Stats for one worker, or for all
    Stats {
        #[arg(long)]
        worker_name: Option<String>,
    },
    History {
        #[arg(long)]
        worker_name: String,
        #[arg(long, default_value_t = DEFAULT_HISTORY_LIMIT)]
        limit: usize,
    },
    Failures {
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(long, default_value_t = 24)]
        hours: u32,
    },
    /// Delete statistics. Irreversible.
    Clear {
        #[arg(long, required_unless_present = "all", conflicts_with = "all")]
        worker_name: Option<String>,
        #[arg(long)]
        all: bool,
    },
}

fn tasks_or_default(tasks: Vec<AiTask>) -> Option<Vec<AiTask>> {
    (!tasks.is_empty()).then_some(tasks)
}

/// Run one worker command.
///
/// `scheduler start` keeps the scheduler running until `shutdown` resolves.
pub async fn execute<F>(
    ctx: &Arc<AppContext>,
    command: WorkerCommand,
    shutdown: F,
) -> anyhow::Result<Value>
where
    F: Future<Output = ()>,
{
    match command {
        WorkerCommand::Scheduler { action } => scheduler(ctx, action, shutdown).await,
        WorkerCommand::Sync { action } => sync(ctx, action).await,
        WorkerCommand::Ai { action } => ai(ctx, action).await,
        WorkerCommand::Monitor { action } => monitor(ctx, action).await,
    }
}

async fn scheduler_status(ctx: &AppContext) -> Value {
    json!({
        "running": ctx.scheduler.is_running().await,
        "jobs": ctx.scheduler.get_jobs_info().await,
    })
}

async fn scheduler<F>(
    ctx: &Arc<AppContext>,
    action: SchedulerAction,
    shutdown: F,
) -> anyhow::Result<Value>
where
    F: Future<Output = ()>,
{
    match action {
        SchedulerAction::Start => {
            ctx.scheduler.start().await;
            tracing::info!("Scheduler running in the foreground");
            shutdown.await;
            ctx.scheduler.stop().await;
            Ok(scheduler_status(ctx).await)
        }
        SchedulerAction::Stop => {
            ctx.scheduler.stop().await;
            Ok(scheduler_status(ctx).await)
        }
        SchedulerAction::Status => Ok(scheduler_status(ctx).await),
        SchedulerAction::Pause { job_id } => {
            Ok(json!(ctx.scheduler.pause_job(&job_id).await?))
        }
        SchedulerAction::Resume { job_id } => {
            Ok(json!(ctx.scheduler.resume_job(&job_id).await?))
        }
        SchedulerAction::Remove { job_id } => {
            ctx.scheduler.remove_job(&job_id).await?;
            Ok(json!({ "removed": job_id }))
        }
    }
}

async fn sync(ctx: &AppContext, action: SyncAction) -> anyhow::Result<Value> {
    let envelope = match action {
        SyncAction::User {
            user_id,
            provider,
            full,
            lookback_days,
        } => {
            let provider = provider
                .map(|p| p.parse::<ProviderKind>().map_err(|e| anyhow!("{e}")))
                .transpose()?;
            json!(
                ctx.email_sync
                    .run(EmailSyncArgs {
                        user_id,
                        provider,
                        lookback_days: Some(lookback_days),
                        full_sync: full,
                    })
                    .await
            )
        }
        SyncAction::All { lookback_days } => json!(
            ctx.bulk_email_sync
                .run(BulkEmailSyncArgs {
                    lookback_days: Some(lookback_days),
                    full_sync: false,
                })
                .await
        ),
    };
    Ok(envelope)
}

async fn ai(ctx: &AppContext, action: AiAction) -> anyhow::Result<Value> {
    let envelope = match action {
        AiAction::Thread {
            user_id,
            thread_id,
            tasks,
            force,
        } => json!(
            ctx.ai_processing
                .run(AiProcessingArgs {
                    user_id,
                    thread_id,
                    tasks: tasks_or_default(tasks),
                    force_regenerate: force,
                })
                .await
        ),
        AiAction::Bulk {
            user_id,
            limit,
            tasks,
        } => json!(
            ctx.bulk_ai_processing
                .run(BulkAiProcessingArgs {
                    user_id,
                    limit,
                    tasks: tasks_or_default(tasks),
                })
                .await
        ),
    };
    Ok(envelope)
}

async fn monitor(ctx: &AppContext, action: MonitorAction) -> anyhow::Result<Value> {
    let monitor = &ctx.monitor;
    match action {
        MonitorAction::Stats {
            worker_name: Some(name),
        } => Ok(json!(monitor.get_worker_stats(&name).await?)),
        MonitorAction::Stats { worker_name: None } => {
            Ok(json!({ "workers": monitor.get_all_worker_stats().await? }))
        }
        MonitorAction::History { worker_name, limit } => {
            let history = monitor.get_worker_history(&worker_name, limit).await?;
            Ok(json!({ "worker": worker_name, "history": history }))
        }
        MonitorAction::Failures { limit, hours } => {
            let failures = monitor.get_recent_failures(limit, i64::from(hours)).await?;
            Ok(json!({ "failures": failures }))
        }
        MonitorAction::Clear { all: true, .. } => {
            let cleared = monitor.clear_all_stats().await?;
            Ok(json!({ "cleared": cleared }))
        }
        MonitorAction::Clear {
            worker_name: Some(name),
            ..
        } => {
            let cleared = monitor
                .clear_worker_stats(&name)
                .await
                .with_context(|| format!("Failed to clear stats for {name}"))?;
            Ok(json!({ "worker": name, "cleared": cleared }))
        }
        MonitorAction::Clear { .. } => Err(anyhow!("Specify --worker-name or --all")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::metrics::MemoryMetricsStore;
    use crate::store::{LibSqlStore, Store};
    use crate::testing::{FakeFactory, FakeMailbox, ScriptedLlm, account, seed_thread};

    fn parse(args: &[&str]) -> Command {
        let mut argv = vec!["inbox-workers"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv)
            .unwrap()
            .command
            .expect("subcommand")
    }

    fn worker(args: &[&str]) -> WorkerCommand {
        let mut argv = vec!["worker"];
        argv.extend_from_slice(args);
        match parse(&argv) {
            Command::Worker { command } => command,
            other => panic!("unexpected command: {other:?}"),
        }
    }

    async fn context() -> Arc<AppContext> {
        let mut config = AppConfig::from_lookup(|_| None).unwrap();
        config.ai.retry_base_delay = std::time::Duration::from_millis(1);
        config.scheduler.email_sync_enabled = true;
        config.scheduler.ai_processing_enabled = true;
        let store: Arc<dyn Store> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        store
            .upsert_account(&account("u1", ProviderKind::Gmail))
            .await
            .unwrap();
        let factory = FakeFactory::default().with(FakeMailbox::new(ProviderKind::Gmail));
        let ctx = Arc::new(AppContext::new(
            config,
            store,
            Arc::new(MemoryMetricsStore::new()),
            ScriptedLlm::always("Customer asks about order 1234."),
            Arc::new(factory),
        ));
        ctx.register_default_jobs().await.unwrap();
        ctx
    }

    #[test]
    fn no_subcommand_means_serve() {
        let cli = Cli::try_parse_from(["inbox-workers"]).unwrap();
        assert!(cli.command.is_none());
        assert!(matches!(parse(&["serve"]), Command::Serve));
    }

    #[test]
    fn parses_nested_worker_commands() {
        assert!(matches!(
            worker(&["scheduler", "pause", "email_sync_job"]),
            WorkerCommand::Scheduler { action: SchedulerAction::Pause { job_id } } if job_id == "email_sync_job"
        ));

        match worker(&["sync", "user", "--user-id", "u1", "--provider", "gmail", "--full"]) {
            WorkerCommand::Sync {
                action:
                    SyncAction::User {
                        user_id,
                        provider,
                        full,
                        lookback_days,
                    },
            } => {
                assert_eq!(user_id, "u1");
                assert_eq!(provider.as_deref(), Some("gmail"));
                assert!(full);
                assert_eq!(lookback_days, 7);
            }
            other => panic!("unexpected: {other:?}"),
        }

        match worker(&["ai", "thread", "--user-id", "u1", "--thread-id", "t1", "--tasks", "summary,reply"]) {
            WorkerCommand::Ai {
                action: AiAction::Thread { tasks, force, .. },
            } => {
                assert_eq!(tasks, vec![AiTask::Summarize, AiTask::Reply]);
                assert!(!force);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn rejects_bad_arguments() {
        let argv = |args: &[&str]| {
            let mut v = vec!["inbox-workers", "worker"];
            v.extend_from_slice(args);
            Cli::try_parse_from(v)
        };
        assert!(argv(&["ai", "thread", "--user-id", "u1", "--thread-id", "t", "--tasks", "dance"]).is_err());
        assert!(argv(&["monitor", "clear"]).is_err());
        assert!(argv(&["monitor", "clear", "--all", "--worker-name", "w"]).is_err());
        assert!(argv(&["sync", "user"]).is_err());
    }

    #[tokio::test]
    async fn scheduler_commands_act_on_registered_jobs() {
        let ctx = context().await;

        let status = execute(&ctx, worker(&["scheduler", "status"]), async {}).await.unwrap();
        assert_eq!(status["running"], false);
        assert_eq!(status["jobs"].as_array().unwrap().len(), 3);

        let paused = execute(&ctx, worker(&["scheduler", "pause", "email_sync_job"]), async {})
            .await
            .unwrap();
        assert!(paused["next_run_time"].is_null());

        let removed = execute(&ctx, worker(&["scheduler", "remove", "email_sync_job"]), async {})
            .await
            .unwrap();
        assert_eq!(removed["removed"], "email_sync_job");
        assert!(
            execute(&ctx, worker(&["scheduler", "resume", "email_sync_job"]), async {})
                .await
                .is_err()
        );

        let stopped = execute(&ctx, worker(&["scheduler", "start"]), async {}).await.unwrap();
        assert_eq!(stopped["running"], false);
    }

    #[tokio::test]
    async fn sync_ai_and_monitor_commands_share_one_context() {
        let ctx = context().await;
        let thread = seed_thread(
            ctx.store.as_ref(),
            "u1",
            "t1",
            &[("customer@example.com", "Where is order 1234?")],
        )
        .await;

        let synced = execute(&ctx, worker(&["sync", "user", "--user-id", "u1"]), async {})
            .await
            .unwrap();
        assert_eq!(synced["status"], "success", "{synced}");

        let bad_provider = execute(
            &ctx,
            worker(&["sync", "user", "--user-id", "u1", "--provider", "yahoo"]),
            async {},
        )
        .await;
        assert!(bad_provider.is_err());

        let processed = execute(
            &ctx,
            worker(&["ai", "thread", "--user-id", "u1", "--thread-id", "t1", "--tasks", "summary"]),
            async {},
        )
        .await
        .unwrap();
        assert_eq!(processed["status"], "success", "{processed}");
        assert!(ctx.store.get_summary(thread.id).await.unwrap().is_some());

        let stats = execute(&ctx, worker(&["monitor", "stats"]), async {}).await.unwrap();
        assert_eq!(stats["workers"].as_array().unwrap().len(), 2);

        let history = execute(
            &ctx,
            worker(&["monitor", "history", "--worker-name", "email_sync"]),
            async {},
        )
        .await
        .unwrap();
        assert_eq!(history["history"].as_array().unwrap().len(), 1);

        let failures = execute(&ctx, worker(&["monitor", "failures"]), async {}).await.unwrap();
        assert!(failures["failures"].as_array().unwrap().is_empty());

        execute(&ctx, worker(&["monitor", "clear", "--all"]), async {})
            .await
            .unwrap();
        let stats = execute(&ctx, worker(&["monitor", "stats"]), async {}).await.unwrap();
        assert!(stats["workers"].as_array().unwrap().is_empty());
    }
}
