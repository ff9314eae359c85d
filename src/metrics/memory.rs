//! In-process metrics store.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::MetricsStore;
use crate::error::MetricsError;

#[derive(Default)]
struct Inner {
    hashes: HashMap<String, HashMap<String, String>>,
    lists: HashMap<String, VecDeque<String>>,
    deadlines: HashMap<String, Instant>,
}

impl Inner {
    fn purge_if_expired(&mut self, key: &str) {
        let expired = self
            .deadlines
            .get(key)
            .is_some_and(|deadline| *deadline <= Instant::now());
        if expired {
            self.remove(key);
        }
    }

    fn remove(&mut self, key: &str) {
        self.hashes.remove(key);
        self.lists.remove(key);
        self.deadlines.remove(key);
    }
}

/// Mutex-guarded maps. Each operation holds the lock for its whole duration,
/// which gives the same per-primitive atomicity as a shared server.
#[derive(Default)]
pub struct MemoryMetricsStore {
    inner: Mutex<Inner>,
}

impl MemoryMetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, MetricsError> {
        self.inner
            .lock()
            .map_err(|e| MetricsError::Backend(format!("metrics lock poisoned: {e}")))
    }
}

fn parse_field<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, MetricsError>
where
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e: T::Err| MetricsError::Decode {
        key: key.to_string(),
        reason: format!("{raw:?}: {e}"),
    })
}

#[async_trait]
impl MetricsStore for MemoryMetricsStore {
    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<(), MetricsError> {
        let mut inner = self.lock()?;
        inner.purge_if_expired(key);
        let hash = inner.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.to_string(), value.clone());
        }
        Ok(())
    }

    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> Result<(), MetricsError> {
        let mut inner = self.lock()?;
        inner.purge_if_expired(key);
        let hash = inner.hashes.entry(key.to_string()).or_default();
        let current: i64 = match hash.get(field) {
            Some(raw) => parse_field(key, raw)?,
            None => 0,
        };
        hash.insert(field.to_string(), (current + delta).to_string());
        Ok(())
    }

    async fn hash_incr_float(
        &self,
        key: &str,
        field: &str,
        delta: f64,
    ) -> Result<(), MetricsError> {
        let mut inner = self.lock()?;
        inner.purge_if_expired(key);
        let hash = inner.hashes.entry(key.to_string()).or_default();
        let current: f64 = match hash.get(field) {
            Some(raw) => parse_field(key, raw)?,
            None => 0.0,
        };
        hash.insert(field.to_string(), (current + delta).to_string());
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, MetricsError> {
        let mut inner = self.lock()?;
        inner.purge_if_expired(key);
        Ok(inner.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn list_push_front(&self, key: &str, value: String) -> Result<(), MetricsError> {
        let mut inner = self.lock()?;
        inner.purge_if_expired(key);
        inner
            .lists
            .entry(key.to_string())
            .or_default()
            .push_front(value);
        Ok(())
    }

    async fn list_trim(&self, key: &str, keep: usize) -> Result<(), MetricsError> {
        let mut inner = self.lock()?;
        inner.purge_if_expired(key);
        if let Some(list) = inner.lists.get_mut(key) {
            list.truncate(keep);
        }
        Ok(())
    }

    async fn list_range(&self, key: &str, limit: usize) -> Result<Vec<String>, MetricsError> {
        let mut inner = self.lock()?;
        inner.purge_if_expired(key);
        Ok(inner
            .lists
            .get(key)
            .map(|list| list.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), MetricsError> {
        let mut inner = self.lock()?;
        inner.purge_if_expired(key);
        if inner.hashes.contains_key(key) || inner.lists.contains_key(key) {
            inner.deadlines.insert(key.to_string(), Instant::now() + ttl);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), MetricsError> {
        self.lock()?.remove(key);
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, MetricsError> {
        let mut inner = self.lock()?;
        let now = Instant::now();
        let expired: Vec<String> = inner
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            inner.remove(&key);
        }
        let keys: BTreeSet<String> = inner
            .hashes
            .keys()
            .chain(inner.lists.keys())
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        Ok(keys.into_iter().collect())
    }
}
