mod models;
mod schema;
mod sqlite_state_store;

pub use models::*;
pub use schema::STATE_VERSIONED_SCHEMAS;
pub use sqlite_state_store::SqliteStateStore;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};

/// Persistent state of the refresher itself (as opposed to the records it
/// refreshes).
pub trait StateStore: Send + Sync {
    // Key-value state storage
    fn get_state(&self, key: &str) -> Result<Option<String>>;
    fn set_state(&self, key: &str, value: &str) -> Result<()>;
    fn delete_state(&self, key: &str) -> Result<()>;

    // Run locks
    /// Atomically takes the named lock unless an unexpired holder exists.
    /// An expired holder is discarded.
    fn try_acquire_lock(&self, name: &str, ttl: Duration, now: DateTime<Utc>) -> Result<bool>;
    fn release_lock(&self, name: &str) -> Result<()>;
    /// Expiry of the current holder, if the lock is held at `now`.
    fn lock_expires_at(&self, name: &str, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>>;

    // Audit log
    fn append_audit_entry(&self, entry: &AuditLogEntry) -> Result<i64>;
    /// Deletes all but the `keep` most recent entries.
    fn trim_audit_log(&self, keep: usize) -> Result<usize>;
    /// All entries, oldest first.
    fn get_audit_entries(&self) -> Result<Vec<AuditLogEntry>>;
    fn count_audit_entries(&self) -> Result<usize>;
    fn clear_audit_log(&self) -> Result<usize>;
    /// Replaces the whole log with `entries` (oldest first) in one transaction.
    fn replace_audit_log(&self, entries: &[AuditLogEntry]) -> Result<()>;

    // Run history
    fn record_run_start(&self, triggered_by: RunTrigger, started_at: DateTime<Utc>) -> Result<i64>;
    fn record_run_finish(&self, run_id: i64, completion: &RunCompletion) -> Result<()>;
    /// Most recent runs first.
    fn get_run_history(&self, limit: usize) -> Result<Vec<RunRecord>>;
    /// Marks runs left in `running` (from a process that died) as failed.
    fn mark_stale_runs_failed(&self, now: DateTime<Utc>) -> Result<usize>;
}
