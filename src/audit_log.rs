//! Bounded history of applied timestamp changes.
//!
//! Storage is chronological; [`AuditLog::list`] reverses at the read boundary
//! so callers see the newest entries first. At most [`AUDIT_LOG_CAPACITY`]
//! entries are retained, the oldest are evicted first.

use crate::clock::format_local;
use crate::record_store::RecordId;
use crate::state_store::{AuditLogEntry, StateStore};
use anyhow::{anyhow, Result};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

pub const AUDIT_LOG_CAPACITY: usize = 100;
pub const DEFAULT_PAGE_SIZE: usize = 20;

pub const CSV_HEADER: [&str; 5] = ["Date", "RecordID", "Title", "OldTimestamp", "NewTimestamp"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditLogQuery {
    pub record_id: Option<RecordId>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for AuditLogQuery {
    fn default() -> Self {
        Self {
            record_id: None,
            limit: DEFAULT_PAGE_SIZE,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditLogPage {
    /// Newest first.
    pub entries: Vec<AuditLogEntry>,
    /// Matching entries before paging.
    pub total: usize,
}

#[derive(Clone)]
pub struct AuditLog {
    state: Arc<dyn StateStore>,
}

impl AuditLog {
    pub fn new(state: Arc<dyn StateStore>) -> Self {
        Self { state }
    }

    pub fn append(&self, entry: &AuditLogEntry) -> Result<()> {
        self.state.append_audit_entry(entry)?;
        let evicted = self.state.trim_audit_log(AUDIT_LOG_CAPACITY)?;
        if evicted > 0 {
            debug!(evicted, "Evicted oldest audit log entries");
        }
        Ok(())
    }

    /// All retained entries, oldest first.
    pub fn entries(&self) -> Result<Vec<AuditLogEntry>> {
        self.state.get_audit_entries()
    }

    pub fn len(&self) -> Result<usize> {
        self.state.count_audit_entries()
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn list(&self, query: &AuditLogQuery) -> Result<AuditLogPage> {
        let matching: Vec<AuditLogEntry> = self
            .entries()?
            .into_iter()
            .rev()
            .filter(|e| query.record_id.map_or(true, |id| e.record_id == id))
            .collect();
        let total = matching.len();
        let entries = matching
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .collect();
        Ok(AuditLogPage { entries, total })
    }

    /// Empties the log, returning how many entries were dropped.
    pub fn clear(&self) -> Result<usize> {
        self.state.clear_audit_log()
    }

    /// CSV of all retained entries, oldest first.
    pub fn export_csv(&self) -> Result<Vec<u8>> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        writer.write_record(CSV_HEADER)?;
        for entry in self.entries()? {
            writer.write_record([
                format_local(&entry.applied_at),
                entry.record_id.to_string(),
                entry.record_title,
                format_local(&entry.old_timestamp),
                format_local(&entry.new_timestamp),
            ])?;
        }
        writer
            .into_inner()
            .map_err(|e| anyhow!("Failed to finish audit log CSV: {}", e.error()))
    }

    /// Replaces the log with `entries` (any order), keeping the most recent
    /// ones up to capacity.
    pub fn replace_all(&self, entries: Vec<AuditLogEntry>) -> Result<usize> {
        let kept = cap_chronological(entries);
        self.state.replace_audit_log(&kept)?;
        Ok(kept.len())
    }

    /// Adds `entries` to the existing log, keeping the most recent ones up to
    /// capacity.
    pub fn merge(&self, entries: Vec<AuditLogEntry>) -> Result<usize> {
        let mut combined = self.entries()?;
        combined.extend(entries);
        self.replace_all(combined)
    }
}

fn cap_chronological(mut entries: Vec<AuditLogEntry>) -> Vec<AuditLogEntry> {
    // Stable: entries applied in the same second keep their relative order.
    entries.sort_by_key(|e| e.applied_at);
    let excess = entries.len().saturating_sub(AUDIT_LOG_CAPACITY);
    entries.split_off(excess)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_store::SqliteStateStore;
    use chrono::{Duration, NaiveDate, NaiveDateTime};
    use tempfile::TempDir;

    fn base() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 4, 1)
            .unwrap()
            .and_hms_opt(3, 0, 0)
            .unwrap()
    }

    fn entry(record_id: RecordId, minutes: i64) -> AuditLogEntry {
        let at = base() + Duration::minutes(minutes);
        AuditLogEntry {
            record_id,
            record_title: format!("Title, {}", record_id),
            old_timestamp: base() - Duration::days(10),
            new_timestamp: at,
            applied_at: at,
        }
    }

    fn create_test_log() -> (AuditLog, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let state = Arc::new(SqliteStateStore::new(temp_dir.path().join("state.db")).unwrap());
        (AuditLog::new(state), temp_dir)
    }

    #[test]
    fn test_list_is_newest_first_with_filter_and_paging() {
        let (log, _temp_dir) = create_test_log();
        for (i, id) in [1, 2, 1, 3, 1].iter().enumerate() {
            log.append(&entry(*id, i as i64)).unwrap();
        }

        let page = log.list(&AuditLogQuery::default()).unwrap();
        assert_eq!(page.total, 5);
        let ids: Vec<RecordId> = page.entries.iter().map(|e| e.record_id).collect();
        assert_eq!(ids, vec![1, 3, 1, 2, 1]);

        let page = log
            .list(&AuditLogQuery {
                record_id: Some(1),
                limit: 2,
                offset: 1,
            })
            .unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.entries.len(), 2);
        assert_eq!(page.entries[0].applied_at, base() + Duration::minutes(2));
        assert_eq!(page.entries[1].applied_at, base());
    }

    #[test]
    fn test_storage_stays_chronological() {
        let (log, _temp_dir) = create_test_log();
        log.append(&entry(1, 0)).unwrap();
        log.append(&entry(2, 1)).unwrap();
        let ids: Vec<RecordId> = log.entries().unwrap().iter().map(|e| e.record_id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_export_csv_quotes_titles() {
        let (log, _temp_dir) = create_test_log();
        log.append(&entry(42, 0)).unwrap();

        let csv = String::from_utf8(log.export_csv().unwrap()).unwrap();
        let mut lines = csv.lines();
        assert_eq!(
            lines.next(),
            Some("Date,RecordID,Title,OldTimestamp,NewTimestamp")
        );
        assert_eq!(
            lines.next(),
            Some("2024-04-01 03:00:00,42,\"Title, 42\",2024-03-22 03:00:00,2024-04-01 03:00:00")
        );
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn test_export_csv_of_empty_log_has_header_only() {
        let (log, _temp_dir) = create_test_log();
        let csv = String::from_utf8(log.export_csv().unwrap()).unwrap();
        assert_eq!(csv.trim_end(), "Date,RecordID,Title,OldTimestamp,NewTimestamp");
    }

    #[test]
    fn test_clear_reports_count() {
        let (log, _temp_dir) = create_test_log();
        log.append(&entry(1, 0)).unwrap();
        log.append(&entry(2, 1)).unwrap();
        assert_eq!(log.clear().unwrap(), 2);
        assert!(log.is_empty().unwrap());
    }

    #[test]
    fn test_merge_keeps_most_recent_up_to_capacity() {
        let (log, _temp_dir) = create_test_log();
        for i in 0..80 {
            log.append(&entry(i, i)).unwrap();
        }
        let imported: Vec<AuditLogEntry> = (80..120).map(|i| entry(i, i)).collect();

        assert_eq!(log.merge(imported).unwrap(), AUDIT_LOG_CAPACITY);
        let entries = log.entries().unwrap();
        assert_eq!(entries.len(), AUDIT_LOG_CAPACITY);
        assert_eq!(entries.first().unwrap().record_id, 20);
        assert_eq!(entries.last().unwrap().record_id, 119);
    }
}
