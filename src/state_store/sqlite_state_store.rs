use super::schema::STATE_VERSIONED_SCHEMAS;
use super::{AuditLogEntry, RunCompletion, RunRecord, RunStatus, RunTrigger, StateStore};
use crate::clock::{format_local, parse_local};
use crate::sqlite_persistence::open_versioned;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// SQLite-backed [`StateStore`] (`state.db`). Several processes may open the
/// same file; lock acquisition runs in an IMMEDIATE transaction.
#[derive(Clone)]
pub struct SqliteStateStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStateStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = open_versioned(db_path, STATE_VERSIONED_SCHEMAS, "state")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("state database connection mutex poisoned"))
    }

    fn format_datetime(dt: &DateTime<Utc>) -> String {
        dt.to_rfc3339()
    }

    fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    }

    fn row_to_audit_entry(row: &rusqlite::Row) -> rusqlite::Result<AuditLogEntry> {
        let read = |col: &str| -> rusqlite::Result<NaiveDateTime> {
            let raw: String = row.get(col)?;
            parse_local(&raw).ok_or_else(|| {
                rusqlite::Error::InvalidColumnType(0, col.to_string(), rusqlite::types::Type::Text)
            })
        };
        Ok(AuditLogEntry {
            record_id: row.get("record_id")?,
            record_title: row.get("record_title")?,
            old_timestamp: read("old_timestamp")?,
            new_timestamp: read("new_timestamp")?,
            applied_at: read("applied_at")?,
        })
    }

    fn row_to_run(row: &rusqlite::Row) -> rusqlite::Result<RunRecord> {
        let status_str: String = row.get("status")?;
        let trigger_str: String = row.get("triggered_by")?;
        let started_at_str: String = row.get("started_at")?;
        let finished_at_str: Option<String> = row.get("finished_at")?;

        Ok(RunRecord {
            id: row.get("id")?,
            started_at: Self::parse_datetime(&started_at_str).unwrap_or_else(Utc::now),
            finished_at: finished_at_str.and_then(|s| Self::parse_datetime(&s)),
            status: RunStatus::parse(&status_str).unwrap_or(RunStatus::Failed),
            triggered_by: RunTrigger::parse(&trigger_str).unwrap_or(RunTrigger::Manual),
            records_updated: row.get::<_, i64>("records_updated")?.max(0) as u64,
            records_failed: row.get::<_, i64>("records_failed")?.max(0) as u64,
            message: row.get("message")?,
        })
    }

    fn insert_audit_entry(conn: &Connection, entry: &AuditLogEntry) -> Result<i64> {
        conn.execute(
            "INSERT INTO audit_log (record_id, record_title, old_timestamp, new_timestamp, applied_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.record_id,
                entry.record_title,
                format_local(&entry.old_timestamp),
                format_local(&entry.new_timestamp),
                format_local(&entry.applied_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }
}

impl StateStore for SqliteStateStore {
    fn get_state(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM refresher_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set_state(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        let now = Self::format_datetime(&Utc::now());
        conn.execute(
            "INSERT INTO refresher_state (key, value, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
            params![key, value, now],
        )?;
        Ok(())
    }

    fn delete_state(&self, key: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM refresher_state WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn try_acquire_lock(&self, name: &str, ttl: Duration, now: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now_ts = now.timestamp();
        tx.execute(
            "DELETE FROM run_locks WHERE name = ?1 AND expires_at <= ?2",
            params![name, now_ts],
        )?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO run_locks (name, acquired_at, expires_at) VALUES (?1, ?2, ?3)",
            params![name, now_ts, (now + ttl).timestamp()],
        )?;
        tx.commit()?;
        Ok(inserted == 1)
    }

    fn release_lock(&self, name: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM run_locks WHERE name = ?1", params![name])?;
        Ok(())
    }

    fn lock_expires_at(&self, name: &str, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn()?;
        let expires_at: Option<i64> = conn
            .query_row(
                "SELECT expires_at FROM run_locks WHERE name = ?1 AND expires_at > ?2",
                params![name, now.timestamp()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(expires_at.and_then(|ts| DateTime::from_timestamp(ts, 0)))
    }

    fn append_audit_entry(&self, entry: &AuditLogEntry) -> Result<i64> {
        let conn = self.conn()?;
        Self::insert_audit_entry(&conn, entry)
    }

    fn trim_audit_log(&self, keep: usize) -> Result<usize> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM audit_log WHERE id NOT IN
                (SELECT id FROM audit_log ORDER BY id DESC LIMIT ?1)",
            params![keep as i64],
        )?;
        Ok(deleted)
    }

    fn get_audit_entries(&self) -> Result<Vec<AuditLogEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT record_id, record_title, old_timestamp, new_timestamp, applied_at
             FROM audit_log ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map([], Self::row_to_audit_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    fn count_audit_entries(&self) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn clear_audit_log(&self) -> Result<usize> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM audit_log", [])?;
        Ok(deleted)
    }

    fn replace_audit_log(&self, entries: &[AuditLogEntry]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM audit_log", [])?;
        for entry in entries {
            Self::insert_audit_entry(&tx, entry)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn record_run_start(&self, triggered_by: RunTrigger, started_at: DateTime<Utc>) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO refresh_runs (started_at, status, triggered_by) VALUES (?1, ?2, ?3)",
            params![
                Self::format_datetime(&started_at),
                RunStatus::Running.as_str(),
                triggered_by.as_str()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn record_run_finish(&self, run_id: i64, completion: &RunCompletion) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE refresh_runs
             SET finished_at = ?1, status = ?2, records_updated = ?3, records_failed = ?4,
                 message = ?5
             WHERE id = ?6",
            params![
                Self::format_datetime(&completion.finished_at),
                completion.status.as_str(),
                completion.records_updated as i64,
                completion.records_failed as i64,
                completion.message,
                run_id
            ],
        )?;
        Ok(())
    }

    fn get_run_history(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, started_at, finished_at, status, triggered_by, records_updated,
                    records_failed, message
             FROM refresh_runs ORDER BY id DESC LIMIT ?1",
        )?;
        let runs = stmt
            .query_map(params![limit as i64], Self::row_to_run)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    fn mark_stale_runs_failed(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn()?;
        let count = conn.execute(
            "UPDATE refresh_runs SET status = ?1, finished_at = ?2, message = ?3
             WHERE status = ?4",
            params![
                RunStatus::Failed.as_str(),
                Self::format_datetime(&now),
                "Run was interrupted (process exited)",
                RunStatus::Running.as_str()
            ],
        )?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use tempfile::TempDir;

    fn create_test_store() -> (SqliteStateStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = SqliteStateStore::new(temp_dir.path().join("state.db")).unwrap();
        (store, temp_dir)
    }

    fn utc(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, 0).unwrap()
    }

    fn entry(record_id: i64) -> AuditLogEntry {
        let at = NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(3, 0, 0)
            .unwrap();
        AuditLogEntry {
            record_id,
            record_title: format!("Record {}", record_id),
            old_timestamp: at - Duration::days(30),
            new_timestamp: at,
            applied_at: at,
        }
    }

    #[test]
    fn test_state_set_get_delete() {
        let (store, _temp_dir) = create_test_store();
        assert_eq!(store.get_state("k").unwrap(), None);
        store.set_state("k", "v1").unwrap();
        store.set_state("k", "v2").unwrap();
        assert_eq!(store.get_state("k").unwrap().as_deref(), Some("v2"));
        store.delete_state("k").unwrap();
        assert_eq!(store.get_state("k").unwrap(), None);
    }

    #[test]
    fn test_lock_is_exclusive_until_released() {
        let (store, _temp_dir) = create_test_store();
        let ttl = Duration::hours(1);

        assert!(store.try_acquire_lock("run", ttl, utc(10, 0)).unwrap());
        assert!(!store.try_acquire_lock("run", ttl, utc(10, 5)).unwrap());
        assert_eq!(
            store.lock_expires_at("run", utc(10, 5)).unwrap(),
            Some(utc(11, 0))
        );

        store.release_lock("run").unwrap();
        assert_eq!(store.lock_expires_at("run", utc(10, 5)).unwrap(), None);
        assert!(store.try_acquire_lock("run", ttl, utc(10, 6)).unwrap());
    }

    #[test]
    fn test_expired_lock_can_be_taken_over() {
        let (store, _temp_dir) = create_test_store();
        let ttl = Duration::hours(1);

        assert!(store.try_acquire_lock("run", ttl, utc(10, 0)).unwrap());
        assert!(!store.try_acquire_lock("run", ttl, utc(10, 59)).unwrap());
        assert!(store.try_acquire_lock("run", ttl, utc(11, 0)).unwrap());
    }

    #[test]
    fn test_lock_is_shared_between_connections() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state.db");
        let first = SqliteStateStore::new(&path).unwrap();
        let second = SqliteStateStore::new(&path).unwrap();

        assert!(first.try_acquire_lock("run", Duration::hours(1), utc(9, 0)).unwrap());
        assert!(!second.try_acquire_lock("run", Duration::hours(1), utc(9, 1)).unwrap());
    }

    #[test]
    fn test_trim_keeps_most_recent_entries() {
        let (store, _temp_dir) = create_test_store();
        for id in 1..=10 {
            store.append_audit_entry(&entry(id)).unwrap();
        }
        assert_eq!(store.trim_audit_log(4).unwrap(), 6);

        let ids: Vec<i64> = store
            .get_audit_entries()
            .unwrap()
            .iter()
            .map(|e| e.record_id)
            .collect();
        assert_eq!(ids, vec![7, 8, 9, 10]);
    }

    #[test]
    fn test_replace_audit_log() {
        let (store, _temp_dir) = create_test_store();
        store.append_audit_entry(&entry(1)).unwrap();
        store.replace_audit_log(&[entry(5), entry(6)]).unwrap();

        assert_eq!(store.count_audit_entries().unwrap(), 2);
        assert_eq!(store.get_audit_entries().unwrap()[0], entry(5));
        assert_eq!(store.clear_audit_log().unwrap(), 2);
    }

    #[test]
    fn test_run_history_lifecycle() {
        let (store, _temp_dir) = create_test_store();
        let first = store.record_run_start(RunTrigger::Schedule, utc(3, 0)).unwrap();
        store
            .record_run_finish(
                first,
                &RunCompletion {
                    status: RunStatus::Completed,
                    records_updated: 4,
                    records_failed: 1,
                    message: "Updated 4 of 5; 1 failed".to_string(),
                    finished_at: utc(3, 1),
                },
            )
            .unwrap();
        store.record_run_start(RunTrigger::Manual, utc(4, 0)).unwrap();

        assert_eq!(store.mark_stale_runs_failed(utc(5, 0)).unwrap(), 1);

        let history = store.get_run_history(10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, RunStatus::Failed);
        assert_eq!(history[0].triggered_by, RunTrigger::Manual);
        assert_eq!(history[1].status, RunStatus::Completed);
        assert_eq!(history[1].records_updated, 4);
        assert_eq!(history[1].records_failed, 1);
        assert_eq!(history[1].finished_at, Some(utc(3, 1)));
    }
}
