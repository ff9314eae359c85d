//! Worker execution metrics.
//!
//! Layout in the metrics store:
//! - `worker:metrics:{worker}:{job_id}`: one execution record (hash)
//! - `worker:stats:{worker}`: aggregate counters (hash)
//! - `worker:history:{worker}`: newest-first JSON entries (list, capped)
//!
//! Counters are only ever changed through the store's atomic increment
//! primitives. Nothing here reads a counter and writes it back.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::error::MetricsError;
use crate::metrics::MetricsStore;

/// Default number of entries returned by [`WorkerMonitor::get_worker_history`].
pub const DEFAULT_HISTORY_LIMIT: usize = 20;

/// History entries inspected per worker when collecting recent failures.
const FAILURE_SCAN_DEPTH: usize = 50;

/// Result fields worth keeping in an execution record.
const SUMMARY_KEYS: &[&str] = &[
    "total_emails",
    "total_threads",
    "threads_processed",
    "threads_failed",
    "users_synced",
    "users_failed",
];

const KEY_ROOT: &str = "worker:";
const STATS_PREFIX: &str = "worker:stats:";

fn execution_key(worker: &str, job_id: &str) -> String {
    format!("worker:metrics:{worker}:{job_id}")
}

fn stats_key(worker: &str) -> String {
    format!("{STATS_PREFIX}{worker}")
}

fn history_key(worker: &str) -> String {
    format!("worker:history:{worker}")
}

/// Lifecycle status of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed,
    Timeout,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        }
    }

    fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Timeout)
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// One job execution as stored under `worker:metrics:*`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub worker_name: String,
    pub job_id: String,
    pub status: ExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration: Option<f64>,
    pub error_message: Option<String>,
    pub result_summary: Option<serde_json::Value>,
}

/// Aggregate counters for one worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub worker_name: String,
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub total_duration: f64,
    pub average_duration: f64,
    pub last_execution: Option<DateTime<Utc>>,
    pub last_status: Option<ExecutionStatus>,
}

impl WorkerStats {
    fn empty(worker_name: &str) -> Self {
        Self {
            worker_name: worker_name.to_string(),
            ..Self::default()
        }
    }
}

/// One entry of a worker's history list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub job_id: String,
    pub status: ExecutionStatus,
    pub duration: f64,
    pub timestamp: DateTime<Utc>,
}

/// A failed history entry tagged with its worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureEntry {
    pub worker_name: String,
    pub job_id: String,
    pub status: ExecutionStatus,
    pub duration: f64,
    pub timestamp: DateTime<Utc>,
}

/// Everything known about a finished execution.
#[derive(Debug, Clone)]
pub struct Completion<'a> {
    pub worker_name: &'a str,
    pub job_id: &'a str,
    pub status: ExecutionStatus,
    pub duration: f64,
    pub error_message: Option<&'a str>,
    pub result: Option<&'a serde_json::Value>,
}

/// Records job lifecycle metrics and bounded per-worker history.
pub struct WorkerMonitor {
    store: Arc<dyn MetricsStore>,
    ttl: Duration,
    history_cap: usize,
}

impl WorkerMonitor {
    pub fn new(store: Arc<dyn MetricsStore>, config: &MonitorConfig) -> Self {
        Self {
            store,
            ttl: config.ttl,
            history_cap: config.history_cap,
        }
    }

    /// Create the `running` record for a new execution.
    pub async fn record_start(&self, worker_name: &str, job_id: &str) -> Result<(), MetricsError> {
        let key = execution_key(worker_name, job_id);
        self.store
            .hash_set(
                &key,
                &[
                    ("worker_name", worker_name.to_string()),
                    ("job_id", job_id.to_string()),
                    ("status", ExecutionStatus::Running.as_str().to_string()),
                    ("started_at", Utc::now().to_rfc3339()),
                ],
            )
            .await?;
        self.store.expire(&key, self.ttl).await?;
        debug!(worker = %worker_name, job_id = %job_id, "Recorded job start");
        Ok(())
    }

    /// Finalize the execution record, bump aggregates and append to history.
    pub async fn record_completion(&self, completion: Completion<'_>) -> Result<(), MetricsError> {
        let Completion {
            worker_name,
            job_id,
            status,
            duration,
            error_message,
            result,
        } = completion;
        let now = Utc::now();

        let exec_key = execution_key(worker_name, job_id);
        let mut fields = vec![
            ("status", status.as_str().to_string()),
            ("completed_at", now.to_rfc3339()),
            ("duration", duration.to_string()),
        ];
        if let Some(error) = error_message {
            fields.push(("error_message", error.to_string()));
        }
        if let Some(summary) = result.and_then(summarize_result) {
            fields.push(("result_summary", summary.to_string()));
        }
        self.store.hash_set(&exec_key, &fields).await?;
        self.store.expire(&exec_key, self.ttl).await?;

        let stats = stats_key(worker_name);
        self.store.hash_incr(&stats, "total_executions", 1).await?;
        let outcome_field = if status.is_failure() {
            "failed_executions"
        } else {
            "successful_executions"
        };
        self.store.hash_incr(&stats, outcome_field, 1).await?;
        self.store
            .hash_incr_float(&stats, "total_duration", duration)
            .await?;
        self.store
            .hash_set(
                &stats,
                &[
                    ("last_execution", now.to_rfc3339()),
                    ("last_status", status.as_str().to_string()),
                ],
            )
            .await?;
        self.store.expire(&stats, self.ttl).await?;

        let entry = HistoryEntry {
            job_id: job_id.to_string(),
            status,
            duration,
            timestamp: now,
        };
        let encoded = serde_json::to_string(&entry).map_err(|e| MetricsError::Decode {
            key: history_key(worker_name),
            reason: e.to_string(),
        })?;
        let history = history_key(worker_name);
        self.store.list_push_front(&history, encoded).await?;
        self.store.list_trim(&history, self.history_cap).await?;
        self.store.expire(&history, self.ttl).await?;

        debug!(
            worker = %worker_name,
            job_id = %job_id,
            status = status.as_str(),
            duration,
            "Recorded job completion"
        );
        Ok(())
    }

    /// One execution record, if it has not expired.
    pub async fn get_execution(
        &self,
        worker_name: &str,
        job_id: &str,
    ) -> Result<Option<ExecutionRecord>, MetricsError> {
        let fields = self
            .store
            .hash_get_all(&execution_key(worker_name, job_id))
            .await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let status = fields
            .get("status")
            .and_then(|s| s.parse().ok())
            .unwrap_or(ExecutionStatus::Running);
        Ok(Some(ExecutionRecord {
            worker_name: worker_name.to_string(),
            job_id: job_id.to_string(),
            status,
            started_at: fields.get("started_at").and_then(|s| parse_time(s)),
            completed_at: fields.get("completed_at").and_then(|s| parse_time(s)),
            duration: fields.get("duration").and_then(|s| s.parse().ok()),
            error_message: fields.get("error_message").cloned(),
            result_summary: fields
                .get("result_summary")
                .and_then(|s| serde_json::from_str(s).ok()),
        }))
    }

    /// Aggregate stats; zero-valued when the worker never ran.
    pub async fn get_worker_stats(&self, worker_name: &str) -> Result<WorkerStats, MetricsError> {
        let fields = self.store.hash_get_all(&stats_key(worker_name)).await?;
        if fields.is_empty() {
            return Ok(WorkerStats::empty(worker_name));
        }
        Ok(stats_from_fields(worker_name, &fields))
    }

    /// Newest-first history, at most `limit` entries.
    pub async fn get_worker_history(
        &self,
        worker_name: &str,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, MetricsError> {
        let raw = self
            .store
            .list_range(&history_key(worker_name), limit)
            .await?;
        Ok(raw
            .iter()
            .filter_map(|item| match serde_json::from_str::<HistoryEntry>(item) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(worker = %worker_name, error = %e, "Skipping malformed history entry");
                    None
                }
            })
            .collect())
    }

    /// Names of every worker with live stats.
    pub async fn worker_names(&self) -> Result<Vec<String>, MetricsError> {
        Ok(self
            .store
            .keys_with_prefix(STATS_PREFIX)
            .await?
            .into_iter()
            .filter_map(|key| key.strip_prefix(STATS_PREFIX).map(str::to_string))
            .collect())
    }

    pub async fn get_all_worker_stats(&self) -> Result<Vec<WorkerStats>, MetricsError> {
        let mut all = Vec::new();
        for name in self.worker_names().await? {
            all.push(self.get_worker_stats(&name).await?);
        }
        Ok(all)
    }

    /// Failed executions across all workers within the last `hours`, newest first.
    ///
    /// A negative window is empty; a window reaching past the earliest
    /// representable time covers all retained history.
    pub async fn get_recent_failures(
        &self,
        limit: usize,
        hours: i64,
    ) -> Result<Vec<FailureEntry>, MetricsError> {
        let cutoff = failure_cutoff(Utc::now(), hours);
        let mut failures = Vec::new();

        for name in self.worker_names().await? {
            for entry in self.get_worker_history(&name, FAILURE_SCAN_DEPTH).await? {
                if entry.status.is_failure() && entry.timestamp >= cutoff {
                    failures.push(FailureEntry {
                        worker_name: name.clone(),
                        job_id: entry.job_id,
                        status: entry.status,
                        duration: entry.duration,
                        timestamp: entry.timestamp,
                    });
                }
            }
        }

        failures.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        failures.truncate(limit);
        Ok(failures)
    }

    /// Delete stats, history and execution records of one worker. Irreversible.
    pub async fn clear_worker_stats(&self, worker_name: &str) -> Result<usize, MetricsError> {
        let mut keys = vec![stats_key(worker_name), history_key(worker_name)];
        keys.extend(
            self.store
                .keys_with_prefix(&format!("worker:metrics:{worker_name}:"))
                .await?,
        );
        for key in &keys {
            self.store.delete(key).await?;
        }
        info!(worker = %worker_name, keys = keys.len(), "Cleared worker stats");
        Ok(keys.len())
    }

    /// Delete every worker metric. Irreversible.
    pub async fn clear_all_stats(&self) -> Result<usize, MetricsError> {
        let keys = self.store.keys_with_prefix(KEY_ROOT).await?;
        for key in &keys {
            self.store.delete(key).await?;
        }
        info!(keys = keys.len(), "Cleared all worker stats");
        Ok(keys.len())
    }
}

/// Keep only the counters of a worker result worth storing.
fn summarize_result(result: &serde_json::Value) -> Option<serde_json::Value> {
    let object = result.as_object()?;
    let summary: serde_json::Map<String, serde_json::Value> = SUMMARY_KEYS
        .iter()
        .filter_map(|key| object.get(*key).map(|v| (key.to_string(), v.clone())))
        .collect();
    (!summary.is_empty()).then_some(serde_json::Value::Object(summary))
}

fn stats_from_fields(worker_name: &str, fields: &HashMap<String, String>) -> WorkerStats {
    let count = |name: &str| -> u64 {
        fields
            .get(name)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    };
    let total_executions = count("total_executions");
    let total_duration: f64 = fields
        .get("total_duration")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0.0);
    let average_duration = if total_executions > 0 {
        total_duration / total_executions as f64
    } else {
        0.0
    };

    WorkerStats {
        worker_name: worker_name.to_string(),
        total_executions,
        successful_executions: count("successful_executions"),
        failed_executions: count("failed_executions"),
        total_duration,
        average_duration,
        last_execution: fields.get("last_execution").and_then(|s| parse_time(s)),
        last_status: fields.get("last_status").and_then(|s| s.parse().ok()),
    }
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Start of a look-back window of `hours` ending at `now`.
fn failure_cutoff(now: DateTime<Utc>, hours: i64) -> DateTime<Utc> {
    chrono::Duration::try_hours(hours.max(0))
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::metrics::MemoryMetricsStore;

    fn monitor() -> (WorkerMonitor, Arc<MemoryMetricsStore>) {
        let store = Arc::new(MemoryMetricsStore::new());
        let monitor = WorkerMonitor::new(store.clone(), &MonitorConfig::default());
        (monitor, store)
    }

    async fn complete(monitor: &WorkerMonitor, worker: &str, job: &str, status: ExecutionStatus) {
        monitor.record_start(worker, job).await.unwrap();
        monitor
            .record_completion(Completion {
                worker_name: worker,
                job_id: job,
                status,
                duration: 0.5,
                error_message: status.is_failure().then_some("boom"),
                result: None,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unexecuted_worker_has_zero_stats() {
        let (monitor, _) = monitor();
        let stats = monitor.get_worker_stats("never_ran").await.unwrap();
        assert_eq!(stats, WorkerStats::empty("never_ran"));
        assert_eq!(stats.total_executions, 0);
        assert_eq!(stats.average_duration, 0.0);
    }

    #[tokio::test]
    async fn counts_follow_completions() {
        let (monitor, _) = monitor();
        for i in 0..3 {
            complete(&monitor, "w", &format!("ok-{i}"), ExecutionStatus::Success).await;
        }
        for i in 0..2 {
            complete(&monitor, "w", &format!("bad-{i}"), ExecutionStatus::Failed).await;
        }

        let stats = monitor.get_worker_stats("w").await.unwrap();
        assert_eq!(stats.total_executions, 5);
        assert_eq!(stats.successful_executions, 3);
        assert_eq!(stats.failed_executions, 2);
        assert!((stats.total_duration - 2.5).abs() < 1e-9);
        assert!((stats.average_duration - 0.5).abs() < 1e-9);
        assert_eq!(stats.last_status, Some(ExecutionStatus::Failed));
        assert!(stats.last_execution.is_some());
    }

    #[tokio::test]
    async fn history_is_capped_and_newest_first() {
        let (monitor, _) = monitor();
        for i in 0..130 {
            complete(&monitor, "w", &format!("job-{i}"), ExecutionStatus::Success).await;
        }

        let history = monitor.get_worker_history("w", 500).await.unwrap();
        assert_eq!(history.len(), 100);
        assert_eq!(history[0].job_id, "job-129");
        assert_eq!(history[99].job_id, "job-30");

        let recent = monitor
            .get_worker_history("w", DEFAULT_HISTORY_LIMIT)
            .await
            .unwrap();
        assert_eq!(recent.len(), 20);
    }

    #[tokio::test]
    async fn execution_record_is_finalized() {
        let (monitor, _) = monitor();
        monitor.record_start("w", "j1").await.unwrap();
        let running = monitor.get_execution("w", "j1").await.unwrap().unwrap();
        assert_eq!(running.status, ExecutionStatus::Running);
        assert!(running.completed_at.is_none());

        let result = json!({"total_emails": 4, "threads": ["a", "b"], "users_synced": 1});
        monitor
            .record_completion(Completion {
                worker_name: "w",
                job_id: "j1",
                status: ExecutionStatus::Success,
                duration: 1.5,
                error_message: None,
                result: Some(&result),
            })
            .await
            .unwrap();

        let done = monitor.get_execution("w", "j1").await.unwrap().unwrap();
        assert_eq!(done.status, ExecutionStatus::Success);
        assert_eq!(done.duration, Some(1.5));
        assert!(done.started_at.is_some());
        assert_eq!(
            done.result_summary,
            Some(json!({"total_emails": 4, "users_synced": 1}))
        );
    }

    #[tokio::test]
    async fn recent_failures_merge_workers_within_window() {
        let (monitor, store) = monitor();
        complete(&monitor, "a", "a-1", ExecutionStatus::Failed).await;
        complete(&monitor, "a", "a-2", ExecutionStatus::Success).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        complete(&monitor, "b", "b-1", ExecutionStatus::Failed).await;

        let stale = HistoryEntry {
            job_id: "b-old".to_string(),
            status: ExecutionStatus::Failed,
            duration: 1.0,
            timestamp: Utc::now() - chrono::Duration::hours(48),
        };
        store
            .list_push_front(&history_key("b"), serde_json::to_string(&stale).unwrap())
            .await
            .unwrap();

        let failures = monitor.get_recent_failures(10, 24).await.unwrap();
        let ids: Vec<&str> = failures.iter().map(|f| f.job_id.as_str()).collect();
        assert_eq!(ids, vec!["b-1", "a-1"]);
        assert_eq!(failures[0].worker_name, "b");

        assert_eq!(monitor.get_recent_failures(1, 24).await.unwrap().len(), 1);
        assert_eq!(monitor.get_recent_failures(10, 72).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn failure_window_handles_extreme_hours() {
        let (monitor, store) = monitor();
        complete(&monitor, "a", "a-1", ExecutionStatus::Failed).await;
        let ancient = HistoryEntry {
            job_id: "a-ancient".to_string(),
            status: ExecutionStatus::Failed,
            duration: 1.0,
            timestamp: Utc::now() - chrono::Duration::days(365 * 50),
        };
        store
            .list_push_front(&history_key("a"), serde_json::to_string(&ancient).unwrap())
            .await
            .unwrap();

        let all = monitor.get_recent_failures(10, i64::MAX).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].job_id, "a-ancient");

        assert!(monitor.get_recent_failures(10, -5).await.unwrap().is_empty());
        assert!(monitor.get_recent_failures(10, i64::MIN).await.unwrap().is_empty());
    }

    #[test]
    fn failure_cutoff_saturates() {
        let now = Utc::now();
        assert_eq!(failure_cutoff(now, 24), now - chrono::Duration::hours(24));
        assert_eq!(failure_cutoff(now, -1), now);
        assert_eq!(failure_cutoff(now, i64::MAX), DateTime::<Utc>::MIN_UTC);
    }

    #[tokio::test]
    async fn clearing_is_scoped_then_total() {
        let (monitor, _) = monitor();
        complete(&monitor, "a", "a-1", ExecutionStatus::Success).await;
        complete(&monitor, "b", "b-1", ExecutionStatus::Success).await;

        monitor.clear_worker_stats("a").await.unwrap();
        assert_eq!(monitor.get_worker_stats("a").await.unwrap().total_executions, 0);
        assert!(monitor.get_execution("a", "a-1").await.unwrap().is_none());
        assert_eq!(monitor.worker_names().await.unwrap(), vec!["b"]);

        monitor.clear_all_stats().await.unwrap();
        assert!(monitor.get_all_worker_stats().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_completions_do_not_lose_counts() {
        let (monitor, _) = monitor();
        let monitor = Arc::new(monitor);
        let mut handles = Vec::new();
        for i in 0..40 {
            let monitor = Arc::clone(&monitor);
            handles.push(tokio::spawn(async move {
                let job = format!("j{i}");
                let status = if i % 4 == 0 {
                    ExecutionStatus::Failed
                } else {
                    ExecutionStatus::Success
                };
                complete(&monitor, "w", &job, status).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let stats = monitor.get_worker_stats("w").await.unwrap();
        assert_eq!(stats.total_executions, 40);
        assert_eq!(stats.failed_executions, 10);
        assert_eq!(stats.successful_executions, 30);
    }
}
