//! The execute/run contract shared by every worker.
//!
//! Implementors provide `execute()`. Callers use the provided `run()`, which
//! wraps execution with monitor bookkeeping and always hands back a
//! [`JobEnvelope`]. Errors and panics inside `execute()` end up in the
//! envelope's `Failed` variant instead of unwinding into the caller.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::WorkerError;
use crate::worker::monitor::{Completion, ExecutionStatus, WorkerMonitor};

/// Uniform result of one `run()`.
///
/// Serializes as `{status, worker, job_id, duration, started_at, result,
/// completed_at}` or `{status, worker, job_id, duration, started_at, error,
/// failed_at}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub worker: String,
    pub job_id: String,
    /// Wall time of `execute()` in seconds.
    pub duration: f64,
    pub started_at: DateTime<Utc>,
    #[serde(flatten)]
    pub outcome: JobOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum JobOutcome {
    Success {
        result: serde_json::Value,
        completed_at: DateTime<Utc>,
    },
    Failed {
        error: String,
        failed_at: DateTime<Utc>,
    },
}

impl JobEnvelope {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, JobOutcome::Success { .. })
    }

    pub fn result(&self) -> Option<&serde_json::Value> {
        match &self.outcome {
            JobOutcome::Success { result, .. } => Some(result),
            JobOutcome::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            JobOutcome::Success { .. } => None,
            JobOutcome::Failed { error, .. } => Some(error),
        }
    }
}

/// A unit of background work.
#[async_trait]
pub trait Worker: Send + Sync {
    type Args: Send + 'static;
    type Output: Serialize + Send;

    /// Stable name used as the metrics key.
    fn name(&self) -> &str;

    fn monitor(&self) -> &WorkerMonitor;

    /// Domain work. May fail; never called directly by schedulers.
    async fn execute(&self, args: Self::Args) -> Result<Self::Output, WorkerError>;

    /// Run `execute()` under monitoring. Never fails and never panics.
    async fn run(&self, args: Self::Args) -> JobEnvelope {
        let worker = self.name().to_string();
        let job_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let clock = Instant::now();

        if let Err(e) = self.monitor().record_start(&worker, &job_id).await {
            warn!(worker = %worker, job_id = %job_id, error = %e, "Failed to record job start");
        }
        info!(worker = %worker, job_id = %job_id, "Job started");

        let executed = AssertUnwindSafe(self.execute(args)).catch_unwind().await;
        let duration = clock.elapsed().as_secs_f64();

        let outcome = match executed {
            Ok(Ok(output)) => match serde_json::to_value(&output) {
                Ok(result) => JobOutcome::Success {
                    result,
                    completed_at: Utc::now(),
                },
                Err(e) => JobOutcome::Failed {
                    error: format!("failed to serialize result: {e}"),
                    failed_at: Utc::now(),
                },
            },
            Ok(Err(e)) => JobOutcome::Failed {
                error: e.to_string(),
                failed_at: Utc::now(),
            },
            Err(panic) => JobOutcome::Failed {
                error: format!("worker panicked: {}", panic_message(panic.as_ref())),
                failed_at: Utc::now(),
            },
        };

        let (status, error_message, result) = match &outcome {
            JobOutcome::Success { result, .. } => (ExecutionStatus::Success, None, Some(result)),
            JobOutcome::Failed { error, .. } => (ExecutionStatus::Failed, Some(error.as_str()), None),
        };

        match error_message {
            None => info!(worker = %worker, job_id = %job_id, duration, "Job completed"),
            Some(reason) => {
                error!(worker = %worker, job_id = %job_id, duration, error = %reason, "Job failed")
            }
        }

        let completion = Completion {
            worker_name: &worker,
            job_id: &job_id,
            status,
            duration,
            error_message,
            result,
        };
        if let Err(e) = self.monitor().record_completion(completion).await {
            warn!(worker = %worker, job_id = %job_id, error = %e, "Failed to record job completion");
        }

        JobEnvelope {
            worker,
            job_id,
            duration,
            started_at,
            outcome,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
