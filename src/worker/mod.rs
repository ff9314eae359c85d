//! Background workers.
//!
//! - `monitor`: execution records, aggregate stats and capped history
//! - `base`: the `Worker` trait and its never-failing `run()` envelope
//! - `scheduler`: interval and calendar triggers with coalesced firings
//! - `email_sync`, `ai_processing`, `cleanup`: the concrete workers

pub mod ai_processing;
pub mod base;
pub mod cleanup;
pub mod email_sync;
pub mod monitor;
pub mod scheduler;

pub use ai_processing::{
    AiProcessingArgs, AiProcessingDeps, AiProcessingWorker, BulkAiProcessingArgs,
    BulkAiProcessingWorker,
};
pub use base::{JobEnvelope, JobOutcome, Worker};
pub use cleanup::CleanupWorker;
pub use email_sync::{BulkEmailSyncArgs, BulkEmailSyncWorker, EmailSyncArgs, EmailSyncWorker};
pub use monitor::{WorkerMonitor, WorkerStats};
pub use scheduler::{FnJob, JobHandler, JobInfo, Trigger, WorkerScheduler};
