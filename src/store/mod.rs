//! Persistence layer: libSQL-backed storage for threads, messages and AI artifacts.

mod libsql_backend;
pub mod migrations;
mod traits;

pub use libsql_backend::LibSqlStore;
pub use traits::{
    Artifact, MessageRecord, NewMessage, NewThread, Store, SyncLogEntry, SyncLogStatus,
    TaskRecord, ThreadRecord, ThreadUpsert,
};
