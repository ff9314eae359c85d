//! Shared key-value store used for worker metrics.
//!
//! The store is never the record of truth for entities; it only carries
//! execution records, aggregate counters and bounded history lists. Every
//! primitive is atomic on its own so independent processes can update the
//! same counters without a read-modify-write race.

mod libsql_store;
mod memory;

pub use libsql_store::LibSqlMetricsStore;
pub use memory::MemoryMetricsStore;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::MetricsError;

/// Hash, counter, list and expiry primitives.
#[async_trait]
pub trait MetricsStore: Send + Sync {
    /// Set several hash fields at once.
    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<(), MetricsError>;

    /// Atomically add `delta` to an integer hash field (missing counts as 0).
    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> Result<(), MetricsError>;

    /// Atomically add `delta` to a float hash field (missing counts as 0.0).
    async fn hash_incr_float(&self, key: &str, field: &str, delta: f64)
    -> Result<(), MetricsError>;

    /// All fields of a hash; empty when the key does not exist.
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, MetricsError>;

    /// Push a value onto the head of a list.
    async fn list_push_front(&self, key: &str, value: String) -> Result<(), MetricsError>;

    /// Keep only the `keep` newest entries of a list.
    async fn list_trim(&self, key: &str, keep: usize) -> Result<(), MetricsError>;

    /// Up to `limit` entries from the head of a list, newest first.
    async fn list_range(&self, key: &str, limit: usize) -> Result<Vec<String>, MetricsError>;

    /// Expire the key after `ttl`. Re-arming replaces the previous deadline.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), MetricsError>;

    /// Remove a key of any kind.
    async fn delete(&self, key: &str) -> Result<(), MetricsError>;

    /// Live keys starting with `prefix`, sorted.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, MetricsError>;
}
