//! libSQL-backed metrics store.
//!
//! Several processes may open the same file. Counter updates are single
//! upsert statements, so concurrent increments never lose an update.
//! Expired keys are purged lazily at the start of each operation.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::info;

use super::MetricsStore;
use crate::error::MetricsError;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS metric_hashes (
        key TEXT NOT NULL,
        field TEXT NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY (key, field)
    );

    CREATE TABLE IF NOT EXISTS metric_lists (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        key TEXT NOT NULL,
        value TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_metric_lists_key ON metric_lists(key, seq);

    CREATE TABLE IF NOT EXISTS metric_expiry (
        key TEXT PRIMARY KEY,
        expires_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_metric_expiry_deadline ON metric_expiry(expires_at);
"#;

pub struct LibSqlMetricsStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlMetricsStore {
    /// Open (or create) a metrics file shared by every process pointed at it.
    pub async fn new_local(path: &Path) -> Result<Self, MetricsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                MetricsError::Backend(format!("Failed to create metrics directory: {e}"))
            })?;
        }
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| MetricsError::Backend(format!("Failed to open metrics database: {e}")))?;
        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Metrics store opened");
        Ok(store)
    }

    /// In-memory store (for tests).
    pub async fn new_memory() -> Result<Self, MetricsError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| MetricsError::Backend(format!("Failed to create metrics database: {e}")))?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, MetricsError> {
        let conn = db
            .connect()
            .map_err(|e| MetricsError::Backend(format!("Failed to create connection: {e}")))?;

        // Writers from other processes hold the file lock briefly; wait instead of failing.
        let mut pragma = conn
            .query("PRAGMA busy_timeout = 5000", ())
            .await
            .map_err(|e| MetricsError::Backend(format!("busy_timeout: {e}")))?;
        pragma
            .next()
            .await
            .map_err(|e| MetricsError::Backend(format!("busy_timeout: {e}")))?;
        conn.execute_batch(SCHEMA)
            .await
            .map_err(|e| MetricsError::Backend(format!("metrics schema: {e}")))?;

        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    async fn purge_expired(&self) -> Result<(), MetricsError> {
        let now = Utc::now().timestamp_millis();
        for sql in [
            "DELETE FROM metric_hashes WHERE key IN
                (SELECT key FROM metric_expiry WHERE expires_at <= ?1)",
            "DELETE FROM metric_lists WHERE key IN
                (SELECT key FROM metric_expiry WHERE expires_at <= ?1)",
            "DELETE FROM metric_expiry WHERE expires_at <= ?1",
        ] {
            self.conn
                .execute(sql, params![now])
                .await
                .map_err(|e| MetricsError::Backend(format!("purge_expired: {e}")))?;
        }
        Ok(())
    }
}

#[async_trait]
impl MetricsStore for LibSqlMetricsStore {
    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<(), MetricsError> {
        self.purge_expired().await?;
        for (field, value) in fields {
            self.conn
                .execute(
                    "INSERT INTO metric_hashes (key, field, value) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key, field) DO UPDATE SET value = excluded.value",
                    params![key, *field, value.as_str()],
                )
                .await
                .map_err(|e| MetricsError::Backend(format!("hash_set {key}: {e}")))?;
        }
        Ok(())
    }

    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> Result<(), MetricsError> {
        self.purge_expired().await?;
        self.conn
            .execute(
                "INSERT INTO metric_hashes (key, field, value) VALUES (?1, ?2, CAST(?3 AS TEXT))
                 ON CONFLICT(key, field) DO UPDATE
                 SET value = CAST(CAST(metric_hashes.value AS INTEGER) + ?3 AS TEXT)",
                params![key, field, delta],
            )
            .await
            .map_err(|e| MetricsError::Backend(format!("hash_incr {key}.{field}: {e}")))?;
        Ok(())
    }

    async fn hash_incr_float(
        &self,
        key: &str,
        field: &str,
        delta: f64,
    ) -> Result<(), MetricsError> {
        self.purge_expired().await?;
        self.conn
            .execute(
                "INSERT INTO metric_hashes (key, field, value) VALUES (?1, ?2, CAST(?3 AS TEXT))
                 ON CONFLICT(key, field) DO UPDATE
                 SET value = CAST(CAST(metric_hashes.value AS REAL) + ?3 AS TEXT)",
                params![key, field, delta],
            )
            .await
            .map_err(|e| MetricsError::Backend(format!("hash_incr_float {key}.{field}: {e}")))?;
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, MetricsError> {
        self.purge_expired().await?;
        let mut rows = self
            .conn
            .query(
                "SELECT field, value FROM metric_hashes WHERE key = ?1",
                params![key],
            )
            .await
            .map_err(|e| MetricsError::Backend(format!("hash_get_all {key}: {e}")))?;

        let mut fields = HashMap::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| MetricsError::Backend(format!("hash_get_all {key}: {e}")))?
        {
            let field: String = row.get(0).map_err(|e| decode(key, e))?;
            let value: String = row.get(1).map_err(|e| decode(key, e))?;
            fields.insert(field, value);
        }
        Ok(fields)
    }

    async fn list_push_front(&self, key: &str, value: String) -> Result<(), MetricsError> {
        self.purge_expired().await?;
        self.conn
            .execute(
                "INSERT INTO metric_lists (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .await
            .map_err(|e| MetricsError::Backend(format!("list_push_front {key}: {e}")))?;
        Ok(())
    }

    async fn list_trim(&self, key: &str, keep: usize) -> Result<(), MetricsError> {
        self.purge_expired().await?;
        self.conn
            .execute(
                "DELETE FROM metric_lists WHERE key = ?1 AND seq NOT IN
                    (SELECT seq FROM metric_lists WHERE key = ?1 ORDER BY seq DESC LIMIT ?2)",
                params![key, keep as i64],
            )
            .await
            .map_err(|e| MetricsError::Backend(format!("list_trim {key}: {e}")))?;
        Ok(())
    }

    async fn list_range(&self, key: &str, limit: usize) -> Result<Vec<String>, MetricsError> {
        self.purge_expired().await?;
        let mut rows = self
            .conn
            .query(
                "SELECT value FROM metric_lists WHERE key = ?1 ORDER BY seq DESC LIMIT ?2",
                params![key, limit as i64],
            )
            .await
            .map_err(|e| MetricsError::Backend(format!("list_range {key}: {e}")))?;

        let mut values = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| MetricsError::Backend(format!("list_range {key}: {e}")))?
        {
            values.push(row.get::<String>(0).map_err(|e| decode(key, e))?);
        }
        Ok(values)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), MetricsError> {
        self.purge_expired().await?;
        let expires_at = Utc::now().timestamp_millis() + ttl.as_millis() as i64;
        self.conn
            .execute(
                "INSERT INTO metric_expiry (key, expires_at)
                 SELECT ?1, ?2
                 WHERE EXISTS (SELECT 1 FROM metric_hashes WHERE key = ?1)
                    OR EXISTS (SELECT 1 FROM metric_lists WHERE key = ?1)
                 ON CONFLICT(key) DO UPDATE SET expires_at = excluded.expires_at",
                params![key, expires_at],
            )
            .await
            .map_err(|e| MetricsError::Backend(format!("expire {key}: {e}")))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), MetricsError> {
        for sql in [
            "DELETE FROM metric_hashes WHERE key = ?1",
            "DELETE FROM metric_lists WHERE key = ?1",
            "DELETE FROM metric_expiry WHERE key = ?1",
        ] {
            self.conn
                .execute(sql, params![key])
                .await
                .map_err(|e| MetricsError::Backend(format!("delete {key}: {e}")))?;
        }
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, MetricsError> {
        self.purge_expired().await?;
        // substr instead of LIKE: worker names contain '_', a LIKE wildcard.
        let mut rows = self
            .conn
            .query(
                "SELECT key FROM metric_hashes WHERE substr(key, 1, length(?1)) = ?1
                 UNION
                 SELECT key FROM metric_lists WHERE substr(key, 1, length(?1)) = ?1
                 ORDER BY key",
                params![prefix],
            )
            .await
            .map_err(|e| MetricsError::Backend(format!("keys_with_prefix {prefix}: {e}")))?;

        let mut keys = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| MetricsError::Backend(format!("keys_with_prefix {prefix}: {e}")))?
        {
            keys.push(row.get::<String>(0).map_err(|e| decode(prefix, e))?);
        }
        Ok(keys)
    }
}

fn decode(key: &str, e: libsql::Error) -> MetricsError {
    MetricsError::Decode {
        key: key.to_string(),
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn increments_are_applied_in_sql() {
        let store = LibSqlMetricsStore::new_memory().await.unwrap();
        store.hash_incr("worker:stats:a", "total_executions", 1).await.unwrap();
        store.hash_incr("worker:stats:a", "total_executions", 1).await.unwrap();
        store.hash_incr_float("worker:stats:a", "total_duration", 0.25).await.unwrap();
        store.hash_incr_float("worker:stats:a", "total_duration", 0.5).await.unwrap();
        store
            .hash_set("worker:stats:a", &[("last_status", "success".to_string())])
            .await
            .unwrap();

        let all = store.hash_get_all("worker:stats:a").await.unwrap();
        assert_eq!(all["total_executions"], "2");
        assert_eq!(all["total_duration"].parse::<f64>().unwrap(), 0.75);
        assert_eq!(all["last_status"], "success");
    }

    #[tokio::test]
    async fn lists_trim_to_newest_entries() {
        let store = LibSqlMetricsStore::new_memory().await.unwrap();
        for i in 0..10 {
            store.list_push_front("h", format!("e{i}")).await.unwrap();
            store.list_trim("h", 4).await.unwrap();
        }
        let entries = store.list_range("h", 100).await.unwrap();
        assert_eq!(entries, vec!["e9", "e8", "e7", "e6"]);
    }

    #[tokio::test]
    async fn zero_ttl_expires_immediately() {
        let store = LibSqlMetricsStore::new_memory().await.unwrap();
        store.hash_set("gone", &[("f", "1".to_string())]).await.unwrap();
        store.hash_set("kept", &[("f", "1".to_string())]).await.unwrap();
        store.expire("gone", Duration::ZERO).await.unwrap();
        store.expire("kept", Duration::from_secs(3600)).await.unwrap();

        assert!(store.hash_get_all("gone").await.unwrap().is_empty());
        assert_eq!(store.keys_with_prefix("").await.unwrap(), vec!["kept"]);
    }

    #[tokio::test]
    async fn prefix_match_treats_underscore_literally() {
        let store = LibSqlMetricsStore::new_memory().await.unwrap();
        store.hash_incr("worker:stats:email_sync", "n", 1).await.unwrap();
        store.hash_incr("worker:stats:emailXsync", "n", 1).await.unwrap();
        store.list_push_front("worker:history:email_sync", "{}".to_string()).await.unwrap();

        let keys = store.keys_with_prefix("worker:stats:email_").await.unwrap();
        assert_eq!(keys, vec!["worker:stats:email_sync"]);
    }

    #[tokio::test]
    async fn two_handles_on_one_file_share_counters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.db");
        let first = LibSqlMetricsStore::new_local(&path).await.unwrap();
        let second = LibSqlMetricsStore::new_local(&path).await.unwrap();

        first.hash_incr("k", "n", 3).await.unwrap();
        second.hash_incr("k", "n", 4).await.unwrap();

        assert_eq!(first.hash_get_all("k").await.unwrap()["n"], "7");
    }

    #[tokio::test]
    async fn delete_removes_every_kind() {
        let store = LibSqlMetricsStore::new_memory().await.unwrap();
        store.hash_set("k", &[("f", "v".to_string())]).await.unwrap();
        store.list_push_front("k", "x".to_string()).await.unwrap();
        store.delete("k").await.unwrap();
        assert!(store.keys_with_prefix("k").await.unwrap().is_empty());
    }
}
