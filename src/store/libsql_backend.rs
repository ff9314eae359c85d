//! libSQL backend: async `Store` trait implementation.
//!
//! Supports local file and in-memory databases. Timestamps are written as
//! RFC 3339 UTC with fixed millisecond precision, so string comparison in
//! SQL orders them chronologically.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};
use uuid::Uuid;

use crate::ai::{BusinessContext, ExtractedTask, PriorityOutput, ReplyOutput, SentimentOutput};
use crate::error::DatabaseError;
use crate::mail::{MailAccount, ProviderKind};
use crate::store::migrations;
use crate::store::traits::{
    Artifact, MessageRecord, NewMessage, NewThread, Store, SyncLogEntry, SyncLogStatus,
    TaskRecord, ThreadRecord, ThreadUpsert,
};

const THREAD_COLUMNS: &str =
    "id, user_id, provider, provider_thread_id, subject, last_message_at, created_at";

const MESSAGE_COLUMNS: &str = "id, thread_id, provider, provider_message_id, subject, \
     from_address, to_addresses, cc_addresses, sent_at, internet_message_id, body_text, created_at";

const SUMMARIES: &str = "thread_summaries";
const PRIORITIES: &str = "thread_priorities";
const SENTIMENTS: &str = "thread_sentiments";
const REPLY_DRAFTS: &str = "reply_drafts";

/// libSQL entity store.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;
        let store = Self::from_database(db)?;
        store.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        let store = Self::from_database(db)?;
        store.run_migrations().await?;
        Ok(store)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_threads(
        &self,
        op: &str,
        sql: &str,
        values: impl libsql::params::IntoParams,
    ) -> Result<Vec<ThreadRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, values)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;
        let mut threads = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            threads.push(row_to_thread(&row)?);
        }
        Ok(threads)
    }

    async fn get_artifact<T>(
        &self,
        table: &'static str,
        thread_id: Uuid,
    ) -> Result<Option<Artifact<T>>, DatabaseError>
    where
        T: DeserializeOwned,
    {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT thread_id, data, model, created_at, updated_at FROM {table} WHERE thread_id = ?1"
                ),
                params![thread_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get {table}: {e}")))?;
        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get {table}: {e}")))?
        {
            Some(row) => Ok(Some(row_to_artifact(&row)?)),
            None => Ok(None),
        }
    }

    /// One row per thread: a second upsert overwrites, never duplicates.
    async fn upsert_artifact<T>(
        &self,
        table: &'static str,
        thread_id: Uuid,
        data: &T,
        model: &str,
    ) -> Result<Artifact<T>, DatabaseError>
    where
        T: Serialize + DeserializeOwned + Sync,
    {
        let json = serde_json::to_string(data)
            .map_err(|e| DatabaseError::Serialization(format!("{table}: {e}")))?;
        let now = ts(&Utc::now());
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "INSERT INTO {table} (thread_id, data, model, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?4)
                     ON CONFLICT (thread_id) DO UPDATE SET
                        data = excluded.data,
                        model = excluded.model,
                        updated_at = excluded.updated_at
                     RETURNING thread_id, data, model, created_at, updated_at"
                ),
                params![thread_id.to_string(), json, model, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert {table}: {e}")))?;
        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert {table}: {e}")))?
            .ok_or_else(|| DatabaseError::Query(format!("upsert {table}: no row returned")))?;
        debug!(table, thread_id = %thread_id, "Artifact stored");
        row_to_artifact(&row)
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad uuid {s:?}: {e}")))
}

fn parse_provider(s: &str) -> Result<ProviderKind, DatabaseError> {
    s.parse()
        .map_err(|e| DatabaseError::Serialization(format!("bad provider {s:?}: {e}")))
}

fn text(row: &libsql::Row, idx: i32) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Serialization(format!("column {idx}: {e}")))
}

fn int(row: &libsql::Row, idx: i32) -> Result<i64, DatabaseError> {
    row.get::<i64>(idx)
        .map_err(|e| DatabaseError::Serialization(format!("column {idx}: {e}")))
}

fn json_col<T: DeserializeOwned>(row: &libsql::Row, idx: i32) -> Result<T, DatabaseError> {
    let raw = text(row, idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| DatabaseError::Serialization(format!("column {idx}: {e}")))
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn row_to_thread(row: &libsql::Row) -> Result<ThreadRecord, DatabaseError> {
    Ok(ThreadRecord {
        id: parse_uuid(&text(row, 0)?)?,
        user_id: text(row, 1)?,
        provider: parse_provider(&text(row, 2)?)?,
        provider_thread_id: text(row, 3)?,
        subject: text(row, 4)?,
        last_message_at: parse_datetime(&text(row, 5)?),
        created_at: parse_datetime(&text(row, 6)?),
    })
}

fn row_to_message(row: &libsql::Row) -> Result<MessageRecord, DatabaseError> {
    Ok(MessageRecord {
        id: parse_uuid(&text(row, 0)?)?,
        thread_id: parse_uuid(&text(row, 1)?)?,
        provider: parse_provider(&text(row, 2)?)?,
        provider_message_id: text(row, 3)?,
        subject: text(row, 4)?,
        from_address: text(row, 5)?,
        to_addresses: json_col(row, 6)?,
        cc_addresses: json_col(row, 7)?,
        sent_at: parse_datetime(&text(row, 8)?),
        internet_message_id: row.get::<String>(9).ok(),
        body_text: text(row, 10)?,
        created_at: parse_datetime(&text(row, 11)?),
    })
}

fn row_to_artifact<T: DeserializeOwned>(row: &libsql::Row) -> Result<Artifact<T>, DatabaseError> {
    Ok(Artifact {
        thread_id: parse_uuid(&text(row, 0)?)?,
        data: json_col(row, 1)?,
        model: text(row, 2)?,
        created_at: parse_datetime(&text(row, 3)?),
        updated_at: parse_datetime(&text(row, 4)?),
    })
}

fn row_to_task(row: &libsql::Row) -> Result<TaskRecord, DatabaseError> {
    Ok(TaskRecord {
        id: parse_uuid(&text(row, 0)?)?,
        thread_id: parse_uuid(&text(row, 1)?)?,
        task: json_col(row, 2)?,
        model: text(row, 3)?,
        created_at: parse_datetime(&text(row, 4)?),
    })
}

fn row_to_sync_log(row: &libsql::Row) -> Result<SyncLogEntry, DatabaseError> {
    Ok(SyncLogEntry {
        user_id: text(row, 0)?,
        provider: parse_provider(&text(row, 1)?)?,
        status: SyncLogStatus::parse(&text(row, 2)?),
        run_time_ms: int(row, 3)?,
        message: text(row, 4)?,
        created_at: parse_datetime(&text(row, 5)?),
    })
}

#[async_trait]
impl Store for LibSqlStore {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Accounts ────────────────────────────────────────────────────

    async fn upsert_account(&self, account: &MailAccount) -> Result<(), DatabaseError> {
        let now = ts(&Utc::now());
        self.conn()
            .execute(
                "INSERT INTO mail_accounts (user_id, provider, email_address, access_token, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT (user_id, provider) DO UPDATE SET
                    email_address = excluded.email_address,
                    access_token = excluded.access_token,
                    updated_at = excluded.updated_at",
                params![
                    account.user_id.as_str(),
                    account.provider.as_str(),
                    account.email_address.as_str(),
                    account.access_token.expose_secret(),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_account: {e}")))?;
        Ok(())
    }

    async fn list_accounts(&self, user_id: &str) -> Result<Vec<MailAccount>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT user_id, provider, email_address, access_token FROM mail_accounts
                 WHERE user_id = ?1 ORDER BY provider",
                params![user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_accounts: {e}")))?;
        let mut accounts = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_accounts: {e}")))?
        {
            accounts.push(MailAccount {
                user_id: text(&row, 0)?,
                provider: parse_provider(&text(&row, 1)?)?,
                email_address: text(&row, 2)?,
                access_token: SecretString::from(text(&row, 3)?),
            });
        }
        Ok(accounts)
    }

    async fn list_account_users(&self) -> Result<Vec<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT DISTINCT user_id FROM mail_accounts ORDER BY user_id",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_account_users: {e}")))?;
        let mut users = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_account_users: {e}")))?
        {
            users.push(text(&row, 0)?);
        }
        Ok(users)
    }

    // ── Threads ─────────────────────────────────────────────────────

    async fn get_thread(&self, id: Uuid) -> Result<Option<ThreadRecord>, DatabaseError> {
        let threads = self
            .query_threads(
                "get_thread",
                &format!("SELECT {THREAD_COLUMNS} FROM threads WHERE id = ?1"),
                params![id.to_string()],
            )
            .await?;
        Ok(threads.into_iter().next())
    }

    async fn find_thread(
        &self,
        user_id: &str,
        provider: Option<ProviderKind>,
        provider_thread_id: &str,
    ) -> Result<Option<ThreadRecord>, DatabaseError> {
        let threads = self
            .query_threads(
                "find_thread",
                &format!(
                    "SELECT {THREAD_COLUMNS} FROM threads
                     WHERE user_id = ?1 AND provider_thread_id = ?2 AND (?3 IS NULL OR provider = ?3)
                     ORDER BY created_at LIMIT 1"
                ),
                params![
                    user_id,
                    provider_thread_id,
                    opt_text(provider.map(|p| p.as_str())),
                ],
            )
            .await?;
        Ok(threads.into_iter().next())
    }

    async fn upsert_thread(&self, thread: &NewThread) -> Result<ThreadUpsert, DatabaseError> {
        let candidate_id = Uuid::new_v4();
        let threads = self
            .query_threads(
                "upsert_thread",
                &format!(
                    "INSERT INTO threads ({THREAD_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT (provider, provider_thread_id, user_id) DO UPDATE SET
                        last_message_at = CASE
                            WHEN excluded.last_message_at > threads.last_message_at
                            THEN excluded.last_message_at
                            ELSE threads.last_message_at
                        END,
                        subject = CASE WHEN threads.subject = '' THEN excluded.subject ELSE threads.subject END
                     RETURNING {THREAD_COLUMNS}"
                ),
                params![
                    candidate_id.to_string(),
                    thread.user_id.as_str(),
                    thread.provider.as_str(),
                    thread.provider_thread_id.as_str(),
                    thread.subject.as_str(),
                    ts(&thread.last_message_at),
                    ts(&Utc::now()),
                ],
            )
            .await?;
        let record = threads
            .into_iter()
            .next()
            .ok_or_else(|| DatabaseError::Query("upsert_thread: no row returned".to_string()))?;
        let created = record.id == candidate_id;
        if created {
            debug!(thread_id = %record.id, provider_thread_id = %record.provider_thread_id, "Thread created");
        }
        Ok(ThreadUpsert {
            thread: record,
            created,
        })
    }

    async fn list_threads_without_summary(
        &self,
        user_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ThreadRecord>, DatabaseError> {
        let columns = THREAD_COLUMNS
            .split(", ")
            .map(|c| format!("t.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        self.query_threads(
            "list_threads_without_summary",
            &format!(
                "SELECT {columns} FROM threads t
                 LEFT JOIN thread_summaries s ON s.thread_id = t.id
                 WHERE s.thread_id IS NULL AND (?1 IS NULL OR t.user_id = ?1)
                 ORDER BY t.last_message_at DESC LIMIT ?2"
            ),
            params![opt_text(user_id), limit as i64],
        )
        .await
    }

    // ── Messages ────────────────────────────────────────────────────

    async fn message_exists(
        &self,
        provider: ProviderKind,
        provider_message_id: &str,
    ) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM messages WHERE provider = ?1 AND provider_message_id = ?2",
                params![provider.as_str(), provider_message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("message_exists: {e}")))?;
        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("message_exists: {e}")))?;
        Ok(row.is_some())
    }

    async fn insert_message(&self, message: &NewMessage) -> Result<bool, DatabaseError> {
        let id = Uuid::new_v4();
        let inserted = self
            .conn()
            .execute(
                &format!(
                    "INSERT INTO messages ({MESSAGE_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                     ON CONFLICT (provider, provider_message_id) DO NOTHING"
                ),
                params![
                    id.to_string(),
                    message.thread_id.to_string(),
                    message.provider.as_str(),
                    message.provider_message_id.as_str(),
                    message.subject.as_str(),
                    message.from_address.as_str(),
                    to_json(&message.to_addresses)?,
                    to_json(&message.cc_addresses)?,
                    ts(&message.sent_at),
                    opt_text(message.internet_message_id.as_deref()),
                    message.body_text.as_str(),
                    ts(&Utc::now()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_message: {e}")))?;

        if inserted > 0 {
            debug!(id = %id, provider_message_id = %message.provider_message_id, "Message inserted");
        }
        Ok(inserted > 0)
    }

    async fn list_thread_messages(
        &self,
        thread_id: Uuid,
    ) -> Result<Vec<MessageRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE thread_id = ?1
                     ORDER BY sent_at ASC, created_at ASC"
                ),
                params![thread_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_thread_messages: {e}")))?;
        let mut messages = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_thread_messages: {e}")))?
        {
            messages.push(row_to_message(&row)?);
        }
        Ok(messages)
    }

    // ── Business context ────────────────────────────────────────────

    async fn get_business_context(
        &self,
        user_id: &str,
    ) -> Result<Option<BusinessContext>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT data FROM business_contexts WHERE user_id = ?1",
                params![user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_business_context: {e}")))?;
        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_business_context: {e}")))?
        {
            Some(row) => Ok(Some(json_col(&row, 0)?)),
            None => Ok(None),
        }
    }

    async fn upsert_business_context(
        &self,
        context: &BusinessContext,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO business_contexts (user_id, data, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (user_id) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
                params![context.user_id.as_str(), to_json(context)?, ts(&Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_business_context: {e}")))?;
        Ok(())
    }

    // ── AI artifacts ────────────────────────────────────────────────

    async fn get_summary(&self, thread_id: Uuid) -> Result<Option<Artifact<String>>, DatabaseError> {
        self.get_artifact(SUMMARIES, thread_id).await
    }

    async fn upsert_summary(
        &self,
        thread_id: Uuid,
        summary: &str,
        model: &str,
    ) -> Result<Artifact<String>, DatabaseError> {
        self.upsert_artifact(SUMMARIES, thread_id, &summary.to_string(), model)
            .await
    }

    async fn get_priority(
        &self,
        thread_id: Uuid,
    ) -> Result<Option<Artifact<PriorityOutput>>, DatabaseError> {
        self.get_artifact(PRIORITIES, thread_id).await
    }

    async fn upsert_priority(
        &self,
        thread_id: Uuid,
        priority: &PriorityOutput,
        model: &str,
    ) -> Result<Artifact<PriorityOutput>, DatabaseError> {
        self.upsert_artifact(PRIORITIES, thread_id, priority, model)
            .await
    }

    async fn get_sentiment(
        &self,
        thread_id: Uuid,
    ) -> Result<Option<Artifact<SentimentOutput>>, DatabaseError> {
        self.get_artifact(SENTIMENTS, thread_id).await
    }

    async fn upsert_sentiment(
        &self,
        thread_id: Uuid,
        sentiment: &SentimentOutput,
        model: &str,
    ) -> Result<Artifact<SentimentOutput>, DatabaseError> {
        self.upsert_artifact(SENTIMENTS, thread_id, sentiment, model)
            .await
    }

    async fn get_reply_draft(
        &self,
        thread_id: Uuid,
    ) -> Result<Option<Artifact<ReplyOutput>>, DatabaseError> {
        self.get_artifact(REPLY_DRAFTS, thread_id).await
    }

    async fn upsert_reply_draft(
        &self,
        thread_id: Uuid,
        reply: &ReplyOutput,
        model: &str,
    ) -> Result<Artifact<ReplyOutput>, DatabaseError> {
        self.upsert_artifact(REPLY_DRAFTS, thread_id, reply, model)
            .await
    }

    async fn replace_tasks(
        &self,
        thread_id: Uuid,
        tasks: &[ExtractedTask],
        model: &str,
    ) -> Result<Vec<TaskRecord>, DatabaseError> {
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("replace_tasks begin: {e}")))?;
        tx.execute(
            "DELETE FROM thread_tasks WHERE thread_id = ?1",
            params![thread_id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("replace_tasks delete: {e}")))?;

        let now = Utc::now();
        let mut records = Vec::with_capacity(tasks.len());
        for (position, task) in tasks.iter().enumerate() {
            let id = Uuid::new_v4();
            tx.execute(
                "INSERT INTO thread_tasks (id, thread_id, position, data, model, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.to_string(),
                    thread_id.to_string(),
                    position as i64,
                    to_json(task)?,
                    model,
                    ts(&now),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("replace_tasks insert: {e}")))?;
            records.push(TaskRecord {
                id,
                thread_id,
                task: task.clone(),
                model: model.to_string(),
                created_at: now,
            });
        }
        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("replace_tasks commit: {e}")))?;
        Ok(records)
    }

    async fn list_tasks(&self, thread_id: Uuid) -> Result<Vec<TaskRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, thread_id, data, model, created_at FROM thread_tasks
                 WHERE thread_id = ?1 ORDER BY position",
                params![thread_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_tasks: {e}")))?;
        let mut tasks = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_tasks: {e}")))?
        {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }

    // ── Sync logs ───────────────────────────────────────────────────

    async fn record_sync_log(&self, entry: &SyncLogEntry) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO sync_logs (user_id, provider, status, run_time_ms, message, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    entry.user_id.as_str(),
                    entry.provider.as_str(),
                    entry.status.as_str(),
                    entry.run_time_ms,
                    entry.message.as_str(),
                    ts(&entry.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_sync_log: {e}")))?;
        Ok(())
    }

    async fn latest_sync_logs(&self, user_id: &str) -> Result<Vec<SyncLogEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT user_id, provider, status, run_time_ms, message, created_at
                 FROM sync_logs s
                 WHERE user_id = ?1 AND id = (
                    SELECT MAX(id) FROM sync_logs
                    WHERE user_id = s.user_id AND provider = s.provider
                 )
                 ORDER BY provider",
                params![user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("latest_sync_logs: {e}")))?;
        let mut logs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("latest_sync_logs: {e}")))?
        {
            logs.push(row_to_sync_log(&row)?);
        }
        Ok(logs)
    }

    async fn prune_sync_logs(&self, before: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let removed = self
            .conn()
            .execute(
                "DELETE FROM sync_logs WHERE created_at < ?1",
                params![ts(&before)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("prune_sync_logs: {e}")))?;
        Ok(removed as usize)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::ai::PriorityLevel;

    async fn store() -> LibSqlStore {
        LibSqlStore::new_memory().await.unwrap()
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 14, hour, 0, 0).unwrap()
    }

    fn new_thread(provider_thread_id: &str, last: DateTime<Utc>) -> NewThread {
        NewThread {
            user_id: "u1".to_string(),
            provider: ProviderKind::Gmail,
            provider_thread_id: provider_thread_id.to_string(),
            subject: "Invoice".to_string(),
            last_message_at: last,
        }
    }

    fn new_message(thread_id: Uuid, id: &str, sent: DateTime<Utc>) -> NewMessage {
        NewMessage {
            thread_id,
            provider: ProviderKind::Gmail,
            provider_message_id: id.to_string(),
            subject: "Invoice".to_string(),
            from_address: "a@example.com".to_string(),
            to_addresses: vec!["b@example.com".to_string()],
            cc_addresses: vec![],
            sent_at: sent,
            internet_message_id: None,
            body_text: format!("body {id}"),
        }
    }

    #[tokio::test]
    async fn last_message_at_only_moves_forward() {
        let store = store().await;
        let first = store.upsert_thread(&new_thread("t1", at(10))).await.unwrap();
        assert!(first.created);

        let older = store.upsert_thread(&new_thread("t1", at(8))).await.unwrap();
        assert!(!older.created);
        assert_eq!(older.thread.id, first.thread.id);
        assert_eq!(older.thread.last_message_at, at(10));

        let newer = store.upsert_thread(&new_thread("t1", at(12))).await.unwrap();
        assert_eq!(newer.thread.last_message_at, at(12));
    }

    #[tokio::test]
    async fn threads_are_scoped_per_user() {
        let store = store().await;
        let a = store.upsert_thread(&new_thread("t1", at(10))).await.unwrap();
        let mut other = new_thread("t1", at(10));
        other.user_id = "u2".to_string();
        let b = store.upsert_thread(&other).await.unwrap();
        assert!(b.created);
        assert_ne!(a.thread.id, b.thread.id);

        let found = store
            .find_thread("u2", Some(ProviderKind::Gmail), "t1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, b.thread.id);
        assert!(store
            .find_thread("u1", Some(ProviderKind::Outlook), "t1")
            .await
            .unwrap()
            .is_none());
        assert!(store.find_thread("u1", None, "t1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn message_insert_is_idempotent() {
        let store = store().await;
        let thread = store.upsert_thread(&new_thread("t1", at(10))).await.unwrap().thread;

        assert!(store.insert_message(&new_message(thread.id, "m1", at(10))).await.unwrap());
        assert!(!store.insert_message(&new_message(thread.id, "m1", at(10))).await.unwrap());
        assert!(store.message_exists(ProviderKind::Gmail, "m1").await.unwrap());
        assert!(!store.message_exists(ProviderKind::Outlook, "m1").await.unwrap());

        let messages = store.list_thread_messages(thread.id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].to_addresses, vec!["b@example.com"]);
    }

    #[tokio::test]
    async fn thread_messages_are_ordered_by_sent_at() {
        let store = store().await;
        let thread = store.upsert_thread(&new_thread("t1", at(12))).await.unwrap().thread;
        store.insert_message(&new_message(thread.id, "late", at(12))).await.unwrap();
        store.insert_message(&new_message(thread.id, "early", at(9))).await.unwrap();

        let ids: Vec<String> = store
            .list_thread_messages(thread.id)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.provider_message_id)
            .collect();
        assert_eq!(ids, vec!["early", "late"]);
    }

    #[tokio::test]
    async fn singular_artifacts_overwrite() {
        let store = store().await;
        let thread = store.upsert_thread(&new_thread("t1", at(10))).await.unwrap().thread;

        let first = store.upsert_summary(thread.id, "first", "model-a").await.unwrap();
        let second = store.upsert_summary(thread.id, "second", "model-b").await.unwrap();
        assert_eq!(second.data, "second");
        assert_eq!(second.model, "model-b");
        assert_eq!(second.created_at, first.created_at);

        let mut rows = store
            .conn()
            .query("SELECT COUNT(*) FROM thread_summaries", ())
            .await
            .unwrap();
        let count: i64 = rows.next().await.unwrap().unwrap().get(0).unwrap();
        assert_eq!(count, 1);

        let priority = PriorityOutput {
            priority_level: PriorityLevel::Urgent,
            category: "outage".to_string(),
            reasoning: "site down".to_string(),
        };
        store.upsert_priority(thread.id, &priority, "m").await.unwrap();
        let loaded = store.get_priority(thread.id).await.unwrap().unwrap();
        assert_eq!(loaded.data, priority);
    }

    #[tokio::test]
    async fn unsummarized_threads_exclude_summarized_ones() {
        let store = store().await;
        let a = store.upsert_thread(&new_thread("a", at(8))).await.unwrap().thread;
        let b = store.upsert_thread(&new_thread("b", at(11))).await.unwrap().thread;
        store.upsert_summary(a.id, "done", "m").await.unwrap();

        let pending = store.list_threads_without_summary(Some("u1"), 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, b.id);
        assert!(store
            .list_threads_without_summary(Some("nobody"), 10)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(store.list_threads_without_summary(None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn tasks_are_replaced_wholesale() {
        let store = store().await;
        let thread = store.upsert_thread(&new_thread("t1", at(10))).await.unwrap().thread;
        let task = |title: &str| ExtractedTask {
            title: title.to_string(),
            description: None,
            due_date: None,
            extracted_owner: None,
            priority: "medium".to_string(),
        };

        store
            .replace_tasks(thread.id, &[task("a"), task("b")], "m")
            .await
            .unwrap();
        store.replace_tasks(thread.id, &[task("c")], "m").await.unwrap();

        let titles: Vec<String> = store
            .list_tasks(thread.id)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.task.title)
            .collect();
        assert_eq!(titles, vec!["c"]);
    }

    #[tokio::test]
    async fn sync_logs_latest_and_prune() {
        let store = store().await;
        let now = Utc::now();
        let entry = |provider, status, age_days: i64| SyncLogEntry {
            user_id: "u1".to_string(),
            provider,
            status,
            run_time_ms: 42,
            message: String::new(),
            created_at: now - Duration::days(age_days),
        };
        store.record_sync_log(&entry(ProviderKind::Gmail, SyncLogStatus::Failed, 40)).await.unwrap();
        store.record_sync_log(&entry(ProviderKind::Gmail, SyncLogStatus::Success, 0)).await.unwrap();
        store.record_sync_log(&entry(ProviderKind::Outlook, SyncLogStatus::Partial, 1)).await.unwrap();

        let latest = store.latest_sync_logs("u1").await.unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].provider, ProviderKind::Gmail);
        assert_eq!(latest[0].status, SyncLogStatus::Success);
        assert_eq!(latest[1].status, SyncLogStatus::Partial);

        let removed = store.prune_sync_logs(now - Duration::days(30)).await.unwrap();
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn accounts_round_trip() {
        let store = store().await;
        let account = MailAccount {
            user_id: "u1".to_string(),
            provider: ProviderKind::Outlook,
            email_address: "me@example.com".to_string(),
            access_token: SecretString::from("tok".to_string()),
        };
        store.upsert_account(&account).await.unwrap();
        store.upsert_account(&account).await.unwrap();

        let accounts = store.list_accounts("u1").await.unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].access_token.expose_secret(), "tok");
        assert_eq!(store.list_account_users().await.unwrap(), vec!["u1"]);
    }

    #[tokio::test]
    async fn business_context_round_trip() {
        let store = store().await;
        assert!(store.get_business_context("u1").await.unwrap().is_none());
        let ctx = BusinessContext {
            user_id: "u1".to_string(),
            tone: Some("friendly".to_string()),
            products: vec!["Widget".to_string()],
            ..Default::default()
        };
        store.upsert_business_context(&ctx).await.unwrap();
        assert_eq!(store.get_business_context("u1").await.unwrap(), Some(ctx));
    }
}
