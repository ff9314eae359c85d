//! Periodic job scheduler.
//!
//! Jobs are registered with a [`Trigger`] and a [`JobHandler`]. A background
//! loop calls [`WorkerScheduler::tick_at`] on a fixed cadence; that method
//! holds all firing policy and can be driven directly with synthetic clocks.
//!
//! Per job:
//! - at most one run in flight; a firing that comes due while the previous
//!   run is active is skipped, never queued
//! - several overdue firings collapse into one run
//! - a firing later than the misfire grace period is dropped

use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::SchedulerError;

/// When a job comes due.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// Fixed period, first firing one period after registration.
    Interval(Duration),
    /// Calendar schedule (6-field cron, seconds first, UTC).
    Calendar {
        schedule: cron::Schedule,
        expression: String,
    },
}

impl Trigger {
    pub fn interval(period: Duration) -> Result<Self, SchedulerError> {
        if period.is_zero() {
            return Err(SchedulerError::InvalidTrigger(
                "interval must be non-zero".to_string(),
            ));
        }
        Ok(Self::Interval(period))
    }

    /// Every day at `hour:minute` UTC.
    pub fn daily(hour: u32, minute: u32) -> Result<Self, SchedulerError> {
        if hour > 23 || minute > 59 {
            return Err(SchedulerError::InvalidTrigger(format!(
                "{hour:02}:{minute:02} is not a time of day"
            )));
        }
        Self::cron(&format!("0 {minute} {hour} * * *"))
    }

    pub fn cron(expression: &str) -> Result<Self, SchedulerError> {
        let schedule = cron::Schedule::from_str(expression)
            .map_err(|e| SchedulerError::InvalidTrigger(format!("invalid cron: {e}")))?;
        Ok(Self::Calendar {
            schedule,
            expression: expression.to_string(),
        })
    }

    /// First firing strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Interval(period) => {
                let period = chrono::Duration::from_std(*period).ok()?;
                after.checked_add_signed(period)
            }
            Self::Calendar { schedule, .. } => schedule.after(&after).next(),
        }
    }

    /// Next firing after `now` for a job that was due at `due`.
    ///
    /// Intervals keep their phase relative to `due`, skipping every period
    /// already elapsed.
    fn next_following(&self, due: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Interval(period) => {
                let period_ms = i64::try_from(period.as_millis()).ok()?.max(1);
                let behind_ms = (now - due).num_milliseconds().max(0);
                let steps = behind_ms / period_ms + 1;
                due.checked_add_signed(chrono::Duration::milliseconds(steps * period_ms))
            }
            Self::Calendar { .. } => self.next_after(now),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Interval(period) => {
                let secs = period.as_secs();
                format!(
                    "interval[{}:{:02}:{:02}]",
                    secs / 3600,
                    (secs % 3600) / 60,
                    secs % 60
                )
            }
            Self::Calendar { expression, .. } => format!("cron[{expression}]"),
        }
    }
}

/// Work performed when a job fires.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn fire(&self);
}

/// Adapts an async closure into a [`JobHandler`].
pub struct FnJob<F>(pub F);

#[async_trait]
impl<F, Fut> JobHandler for FnJob<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn fire(&self) {
        (self.0)().await
    }
}

/// Snapshot of a registered job.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    pub name: String,
    /// `None` while paused.
    pub next_run_time: Option<DateTime<Utc>>,
    pub trigger: String,
}

/// What one tick did, by job id.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub fired: Vec<String>,
    pub skipped_running: Vec<String>,
    pub missed: Vec<String>,
}

struct ScheduledJob {
    id: String,
    name: String,
    trigger: Trigger,
    handler: Arc<dyn JobHandler>,
    next_run_time: Option<DateTime<Utc>>,
    running: Option<JoinHandle<()>>,
}

impl ScheduledJob {
    fn info(&self) -> JobInfo {
        JobInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            next_run_time: self.next_run_time,
            trigger: self.trigger.describe(),
        }
    }

    fn is_running(&mut self) -> bool {
        if self.running.as_ref().is_some_and(|h| h.is_finished()) {
            self.running = None;
        }
        self.running.is_some()
    }
}

struct Runner {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owns scheduled jobs and the loop that fires them.
pub struct WorkerScheduler {
    jobs: RwLock<HashMap<String, ScheduledJob>>,
    tick: Duration,
    misfire_grace: chrono::Duration,
    runner: Mutex<Option<Runner>>,
    /// Runs still in flight for jobs that were removed.
    detached: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl WorkerScheduler {
    pub fn new(tick: Duration, misfire_grace: Duration) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            tick,
            misfire_grace: chrono::Duration::from_std(misfire_grace)
                .unwrap_or(chrono::Duration::MAX),
            runner: Mutex::new(None),
            detached: Mutex::new(Vec::new()),
        }
    }

    /// Register a job, replacing any job with the same id.
    ///
    /// A run of the replaced job that is still in flight carries over, so the
    /// new entry will not fire until it finishes.
    pub async fn add_job(
        &self,
        id: &str,
        name: &str,
        trigger: Trigger,
        handler: Arc<dyn JobHandler>,
    ) -> JobInfo {
        let mut job = ScheduledJob {
            id: id.to_string(),
            name: name.to_string(),
            next_run_time: trigger.next_after(Utc::now()),
            trigger,
            handler,
            running: None,
        };
        let info = job.info();

        let mut jobs = self.jobs.write().await;
        if let Some(mut previous) = jobs.remove(id) {
            job.running = previous.running.take().filter(|h| !h.is_finished());
            info!(job_id = %id, carried_run = job.running.is_some(), "Replaced scheduled job");
        }
        jobs.insert(id.to_string(), job);
        drop(jobs);

        info!(job_id = %id, trigger = %info.trigger, next_run = ?info.next_run_time, "Scheduled job");
        info
    }

    /// Remove a job. A run already in flight finishes on its own and is
    /// still awaited by [`stop`](Self::stop).
    pub async fn remove_job(&self, id: &str) -> Result<(), SchedulerError> {
        let Some(mut job) = self.jobs.write().await.remove(id) else {
            return Err(SchedulerError::JobNotFound(id.to_string()));
        };
        if let Some(handle) = job.running.take().filter(|h| !h.is_finished()) {
            let mut detached = self.detached.lock().await;
            detached.retain(|(_, h)| !h.is_finished());
            detached.push((job.id.clone(), handle));
        }
        info!(job_id = %id, "Removed job");
        Ok(())
    }

    pub async fn pause_job(&self, id: &str) -> Result<JobInfo, SchedulerError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| SchedulerError::JobNotFound(id.to_string()))?;
        job.next_run_time = None;
        info!(job_id = %id, "Paused job");
        Ok(job.info())
    }

    pub async fn resume_job(&self, id: &str) -> Result<JobInfo, SchedulerError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| SchedulerError::JobNotFound(id.to_string()))?;
        if job.next_run_time.is_none() {
            job.next_run_time = job.trigger.next_after(Utc::now());
        }
        info!(job_id = %id, next_run = ?job.next_run_time, "Resumed job");
        Ok(job.info())
    }

    pub async fn get_job(&self, id: &str) -> Option<JobInfo> {
        self.jobs.read().await.get(id).map(ScheduledJob::info)
    }

    /// Snapshots of all jobs, ordered by id.
    pub async fn get_jobs_info(&self) -> Vec<JobInfo> {
        let mut infos: Vec<JobInfo> = self.jobs.read().await.values().map(ScheduledJob::info).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Fire every job due at `now`, applying the per-job policy.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        let mut jobs = self.jobs.write().await;

        for job in jobs.values_mut() {
            let Some(due) = job.next_run_time else {
                continue;
            };
            if due > now {
                continue;
            }
            job.next_run_time = job.trigger.next_following(due, now);

            if job.is_running() {
                debug!(job_id = %job.id, "Previous run still active, skipping firing");
                report.skipped_running.push(job.id.clone());
                continue;
            }

            let lateness = now - due;
            if lateness > self.misfire_grace {
                warn!(
                    job_id = %job.id,
                    late_secs = lateness.num_seconds(),
                    "Missed firing beyond grace period, skipping"
                );
                report.missed.push(job.id.clone());
                continue;
            }

            let handler = Arc::clone(&job.handler);
            let job_id = job.id.clone();
            job.running = Some(tokio::spawn(async move {
                debug!(job_id = %job_id, "Firing job");
                handler.fire().await;
            }));
            report.fired.push(job.id.clone());
        }

        report
    }

    /// Launch the background loop. Returns `false` if it was already running.
    pub async fn start(self: &Arc<Self>) -> bool {
        let mut runner = self.runner.lock().await;
        if runner.is_some() {
            return false;
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        scheduler.tick_at(Utc::now()).await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Scheduler loop exited");
        });

        *runner = Some(Runner { shutdown, handle });
        let jobs = self.jobs.read().await.len();
        info!(jobs, "Scheduler started");
        true
    }

    /// Stop firing new runs, then wait for in-flight runs to finish.
    pub async fn stop(&self) {
        let Some(runner) = self.runner.lock().await.take() else {
            return;
        };
        let _ = runner.shutdown.send(true);
        if let Err(e) = runner.handle.await {
            warn!(error = %e, "Scheduler loop ended abnormally");
        }

        let mut in_flight: Vec<(String, JoinHandle<()>)> = self
            .jobs
            .write()
            .await
            .values_mut()
            .filter_map(|job| job.running.take().map(|h| (job.id.clone(), h)))
            .collect();
        in_flight.append(&mut *self.detached.lock().await);
        for (job_id, handle) in in_flight {
            if let Err(e) = handle.await {
                warn!(job_id = %job_id, error = %e, "Job run ended abnormally");
            }
        }
        info!("Scheduler stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.runner.lock().await.is_some()
    }
}
