//! `Store` trait: the single async interface to entity-of-record data.
//!
//! Threads, messages, AI artifacts, business context, connected accounts and
//! sync logs. Worker metrics live in [`crate::metrics`], never here.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ai::{
    BusinessContext, ExtractedTask, PriorityOutput, ReplyOutput, SentimentOutput,
};
use crate::error::DatabaseError;
use crate::mail::{MailAccount, ProviderKind};

/// A conversation thread owned by one user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThreadRecord {
    pub id: Uuid,
    pub user_id: String,
    pub provider: ProviderKind,
    pub provider_thread_id: String,
    pub subject: String,
    pub last_message_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewThread {
    pub user_id: String,
    pub provider: ProviderKind,
    pub provider_thread_id: String,
    pub subject: String,
    pub last_message_at: DateTime<Utc>,
}

/// Result of a get-or-create on a thread.
#[derive(Debug, Clone)]
pub struct ThreadUpsert {
    pub thread: ThreadRecord,
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageRecord {
    pub id: Uuid,
    pub thread_id: Uuid,
    pub provider: ProviderKind,
    pub provider_message_id: String,
    pub subject: String,
    pub from_address: String,
    pub to_addresses: Vec<String>,
    pub cc_addresses: Vec<String>,
    pub sent_at: DateTime<Utc>,
    pub internet_message_id: Option<String>,
    pub body_text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub thread_id: Uuid,
    pub provider: ProviderKind,
    pub provider_message_id: String,
    pub subject: String,
    pub from_address: String,
    pub to_addresses: Vec<String>,
    pub cc_addresses: Vec<String>,
    pub sent_at: DateTime<Utc>,
    pub internet_message_id: Option<String>,
    pub body_text: String,
}

/// A singular per-thread AI artifact.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Artifact<T> {
    pub thread_id: Uuid,
    pub data: T,
    /// Provider name that generated it, e.g. `gemini-gemini-1.5-flash`.
    pub model: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRecord {
    pub id: Uuid,
    pub thread_id: Uuid,
    #[serde(flatten)]
    pub task: ExtractedTask,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

/// Outcome of one account sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncLogStatus {
    Success,
    /// Finished with per-message errors.
    Partial,
    Failed,
}

impl SyncLogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }

    pub(crate) fn parse(s: &str) -> Self {
        match s {
            "success" => Self::Success,
            "partial" => Self::Partial,
            _ => Self::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncLogEntry {
    pub user_id: String,
    pub provider: ProviderKind,
    pub status: SyncLogStatus,
    pub run_time_ms: i64,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Backend-agnostic entity store.
///
/// Identity rules the backend must enforce:
/// - a message is unique on `(provider, provider_message_id)`
/// - a thread is unique on `(provider, provider_thread_id, user_id)`
/// - each singular artifact is unique on its thread
#[async_trait]
pub trait Store: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Accounts ────────────────────────────────────────────────────

    async fn upsert_account(&self, account: &MailAccount) -> Result<(), DatabaseError>;

    async fn list_accounts(&self, user_id: &str) -> Result<Vec<MailAccount>, DatabaseError>;

    /// Users with at least one connected account.
    async fn list_account_users(&self) -> Result<Vec<String>, DatabaseError>;

    // ── Threads ─────────────────────────────────────────────────────

    async fn get_thread(&self, id: Uuid) -> Result<Option<ThreadRecord>, DatabaseError>;

    /// Exact match on the provider's native thread id. `provider: None`
    /// searches every provider of the user.
    async fn find_thread(
        &self,
        user_id: &str,
        provider: Option<ProviderKind>,
        provider_thread_id: &str,
    ) -> Result<Option<ThreadRecord>, DatabaseError>;

    /// Get-or-create. An existing thread's `last_message_at` only moves forward.
    async fn upsert_thread(&self, thread: &NewThread) -> Result<ThreadUpsert, DatabaseError>;

    /// Most recently active threads that have no summary yet.
    async fn list_threads_without_summary(
        &self,
        user_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ThreadRecord>, DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    async fn message_exists(
        &self,
        provider: ProviderKind,
        provider_message_id: &str,
    ) -> Result<bool, DatabaseError>;

    /// Insert unless already present. Returns whether a row was written.
    async fn insert_message(&self, message: &NewMessage) -> Result<bool, DatabaseError>;

    /// Messages of a thread, oldest first.
    async fn list_thread_messages(&self, thread_id: Uuid)
    -> Result<Vec<MessageRecord>, DatabaseError>;

    // ── Business context ────────────────────────────────────────────

    async fn get_business_context(
        &self,
        user_id: &str,
    ) -> Result<Option<BusinessContext>, DatabaseError>;

    async fn upsert_business_context(&self, context: &BusinessContext)
    -> Result<(), DatabaseError>;

    // ── AI artifacts ────────────────────────────────────────────────

    async fn get_summary(&self, thread_id: Uuid) -> Result<Option<Artifact<String>>, DatabaseError>;

    async fn upsert_summary(
        &self,
        thread_id: Uuid,
        summary: &str,
        model: &str,
    ) -> Result<Artifact<String>, DatabaseError>;

    async fn get_priority(
        &self,
        thread_id: Uuid,
    ) -> Result<Option<Artifact<PriorityOutput>>, DatabaseError>;

    async fn upsert_priority(
        &self,
        thread_id: Uuid,
        priority: &PriorityOutput,
        model: &str,
    ) -> Result<Artifact<PriorityOutput>, DatabaseError>;

    async fn get_sentiment(
        &self,
        thread_id: Uuid,
    ) -> Result<Option<Artifact<SentimentOutput>>, DatabaseError>;

    async fn upsert_sentiment(
        &self,
        thread_id: Uuid,
        sentiment: &SentimentOutput,
        model: &str,
    ) -> Result<Artifact<SentimentOutput>, DatabaseError>;

    async fn get_reply_draft(
        &self,
        thread_id: Uuid,
    ) -> Result<Option<Artifact<ReplyOutput>>, DatabaseError>;

    async fn upsert_reply_draft(
        &self,
        thread_id: Uuid,
        reply: &ReplyOutput,
        model: &str,
    ) -> Result<Artifact<ReplyOutput>, DatabaseError>;

    /// Replace every task of a thread in one transaction.
    async fn replace_tasks(
        &self,
        thread_id: Uuid,
        tasks: &[ExtractedTask],
        model: &str,
    ) -> Result<Vec<TaskRecord>, DatabaseError>;

    async fn list_tasks(&self, thread_id: Uuid) -> Result<Vec<TaskRecord>, DatabaseError>;

    // ── Sync logs ───────────────────────────────────────────────────

    async fn record_sync_log(&self, entry: &SyncLogEntry) -> Result<(), DatabaseError>;

    /// Newest log per provider for a user.
    async fn latest_sync_logs(&self, user_id: &str) -> Result<Vec<SyncLogEntry>, DatabaseError>;

    /// Delete logs older than `before`. Returns the number removed.
    async fn prune_sync_logs(&self, before: DateTime<Utc>) -> Result<usize, DatabaseError>;
}
