use super::schema::RECORDS_VERSIONED_SCHEMAS;
use super::{
    EligibilityFilter, NewRecord, Record, RecordId, RecordQuery, RecordStatus, RecordStore,
    TimestampPair, TimestampUpdate,
};
use crate::clock::{format_local, parse_local};
use crate::eligibility::META_AUTO_UPDATE_ENABLED;
use crate::sqlite_persistence::open_versioned;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// SQLite-backed [`RecordStore`] (`records.db`).
#[derive(Clone)]
pub struct SqliteRecordStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRecordStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = open_versioned(db_path, RECORDS_VERSIONED_SCHEMAS, "records")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("records database connection mutex poisoned"))
    }

    /// Inserts a record, returning its id. Records are owned by the host
    /// application; this exists for seeding and tests.
    pub fn insert_record(&self, record: &NewRecord) -> Result<RecordId> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO records (id, title, category, status, created_at, created_at_utc,
                                  modified_at, modified_at_utc)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.id,
                record.title,
                record.category,
                record.status.as_str(),
                format_local(&record.created.local),
                format_utc(&record.created.utc),
                format_local(&record.modified.local),
                format_utc(&record.modified.utc),
            ],
        )
        .context("Failed to insert record")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn delete_record(&self, id: RecordId) -> Result<bool> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM records WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<Record> {
        let status_str: String = row.get("status")?;
        Ok(Record {
            id: row.get("id")?,
            title: row.get("title")?,
            category: row.get("category")?,
            status: RecordStatus::parse(&status_str).unwrap_or(RecordStatus::Draft),
            created: read_pair(row, "created_at", "created_at_utc")?,
            modified: read_pair(row, "modified_at", "modified_at_utc")?,
        })
    }
}

fn format_utc(value: &DateTime<Utc>) -> String {
    value.to_rfc3339()
}

fn read_pair(row: &rusqlite::Row, local_col: &str, utc_col: &str) -> rusqlite::Result<TimestampPair> {
    let local_str: String = row.get(local_col)?;
    let utc_str: String = row.get(utc_col)?;
    let local = parse_local(&local_str).ok_or_else(|| {
        rusqlite::Error::InvalidColumnType(0, local_col.to_string(), rusqlite::types::Type::Text)
    })?;
    let utc = DateTime::parse_from_rfc3339(&utc_str)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| local.and_utc());
    Ok(TimestampPair { local, utc })
}

impl RecordStore for SqliteRecordStore {
    fn query(&self, query: &RecordQuery) -> Result<Vec<RecordId>> {
        let mut sql = String::from("SELECT r.id FROM records r WHERE 1 = 1");
        let mut args: Vec<String> = Vec::new();

        if !query.categories.is_empty() {
            let placeholders: Vec<String> = query
                .categories
                .iter()
                .map(|category| {
                    args.push(category.clone());
                    format!("?{}", args.len())
                })
                .collect();
            sql.push_str(&format!(" AND r.category IN ({})", placeholders.join(", ")));
        }

        if let Some(status) = query.status {
            args.push(status.as_str().to_string());
            sql.push_str(&format!(" AND r.status = ?{}", args.len()));
        }

        let enabled_clause = |args: &mut Vec<String>| {
            args.push(META_AUTO_UPDATE_ENABLED.to_string());
            format!(
                "EXISTS (SELECT 1 FROM record_meta m WHERE m.record_id = r.id
                         AND m.meta_key = ?{} AND m.meta_value = 'yes')",
                args.len()
            )
        };
        match query.eligibility {
            EligibilityFilter::Enabled => {
                sql.push_str(&format!(" AND {}", enabled_clause(&mut args)));
            }
            EligibilityFilter::Disabled => {
                sql.push_str(&format!(" AND NOT {}", enabled_clause(&mut args)));
            }
            EligibilityFilter::Any => {}
        }
        sql.push_str(" ORDER BY r.id ASC");

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let ids = stmt
            .query_map(params_from_iter(args.iter()), |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<RecordId>>>()?;
        Ok(ids)
    }

    fn get(&self, id: RecordId) -> Result<Option<Record>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                "SELECT id, title, category, status, created_at, created_at_utc,
                        modified_at, modified_at_utc
                 FROM records WHERE id = ?1",
                params![id],
                Self::row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    fn apply_timestamps(&self, id: RecordId, update: &TimestampUpdate) -> Result<bool> {
        let mut assignments: Vec<&str> = Vec::new();
        let mut args: Vec<Value> = Vec::new();
        for (pair, local_col, utc_col) in [
            (&update.created, "created_at = ?", "created_at_utc = ?"),
            (&update.modified, "modified_at = ?", "modified_at_utc = ?"),
        ] {
            if let Some(pair) = pair {
                assignments.push(local_col);
                assignments.push(utc_col);
                args.push(Value::Text(format_local(&pair.local)));
                args.push(Value::Text(format_utc(&pair.utc)));
            }
        }
        if assignments.is_empty() {
            return Ok(self.get(id)?.is_some());
        }
        args.push(Value::Integer(id));

        let sql = format!("UPDATE records SET {} WHERE id = ?", assignments.join(", "));
        let conn = self.conn()?;
        let updated = conn.execute(&sql, params_from_iter(args))?;
        Ok(updated == 1)
    }

    fn get_meta(&self, id: RecordId, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let value = conn
            .query_row(
                "SELECT meta_value FROM record_meta WHERE record_id = ?1 AND meta_key = ?2",
                params![id, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set_meta(&self, id: RecordId, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO record_meta (record_id, meta_key, meta_value)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(record_id, meta_key) DO UPDATE SET meta_value = ?3",
            params![id, key, value],
        )
        .with_context(|| format!("Failed to set meta {} on record {}", key, id))?;
        Ok(())
    }

    fn delete_meta_keys(&self, keys: &[&str]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let placeholders = (1..=keys.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let conn = self.conn()?;
        let deleted = conn.execute(
            &format!("DELETE FROM record_meta WHERE meta_key IN ({})", placeholders),
            params_from_iter(keys.iter()),
        )?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime};
    use tempfile::TempDir;

    fn ts(day: u32) -> TimestampPair {
        let local: NaiveDateTime = NaiveDate::from_ymd_opt(2024, 1, day)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap();
        TimestampPair {
            local,
            utc: local.and_utc(),
        }
    }

    fn create_test_store() -> (SqliteRecordStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = SqliteRecordStore::new(temp_dir.path().join("records.db")).unwrap();
        (store, temp_dir)
    }

    fn insert(store: &SqliteRecordStore, id: RecordId, category: &str, status: RecordStatus) {
        store
            .insert_record(&NewRecord {
                id: Some(id),
                title: format!("Record {}", id),
                category: category.to_string(),
                status,
                created: ts(1),
                modified: ts(2),
            })
            .unwrap();
    }

    #[test]
    fn test_query_filters_category_status_and_flag() {
        let (store, _temp_dir) = create_test_store();
        insert(&store, 3, "post", RecordStatus::Published);
        insert(&store, 1, "post", RecordStatus::Published);
        insert(&store, 2, "page", RecordStatus::Published);
        insert(&store, 4, "post", RecordStatus::Draft);
        for id in [1, 2, 3, 4] {
            store.set_meta(id, META_AUTO_UPDATE_ENABLED, "yes").unwrap();
        }
        store.set_meta(3, META_AUTO_UPDATE_ENABLED, "no").unwrap();

        let enabled = store
            .query(&RecordQuery {
                categories: vec!["post".to_string()],
                status: Some(RecordStatus::Published),
                eligibility: EligibilityFilter::Enabled,
            })
            .unwrap();
        assert_eq!(enabled, vec![1]);

        let disabled = store
            .query(&RecordQuery {
                categories: vec!["post".to_string()],
                status: Some(RecordStatus::Published),
                eligibility: EligibilityFilter::Disabled,
            })
            .unwrap();
        assert_eq!(disabled, vec![3]);

        let everything = store.query(&RecordQuery::default()).unwrap();
        assert_eq!(everything, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_apply_timestamps_touches_only_requested_fields() {
        let (store, _temp_dir) = create_test_store();
        insert(&store, 7, "post", RecordStatus::Published);

        let applied = store
            .apply_timestamps(
                7,
                &TimestampUpdate {
                    created: Some(ts(20)),
                    modified: None,
                },
            )
            .unwrap();
        assert!(applied);

        let record = store.get(7).unwrap().unwrap();
        assert_eq!(record.created, ts(20));
        assert_eq!(record.modified, ts(2));
    }

    #[test]
    fn test_apply_timestamps_on_missing_record_returns_false() {
        let (store, _temp_dir) = create_test_store();
        let applied = store
            .apply_timestamps(
                99,
                &TimestampUpdate {
                    created: Some(ts(5)),
                    modified: Some(ts(5)),
                },
            )
            .unwrap();
        assert!(!applied);
    }

    #[test]
    fn test_meta_upsert_and_bulk_delete() {
        let (store, _temp_dir) = create_test_store();
        insert(&store, 1, "post", RecordStatus::Published);
        insert(&store, 2, "post", RecordStatus::Published);

        store.set_meta(1, "update_count", "1").unwrap();
        store.set_meta(1, "update_count", "2").unwrap();
        store.set_meta(2, "update_count", "5").unwrap();
        store.set_meta(2, "other", "x").unwrap();
        assert_eq!(
            store.get_meta(1, "update_count").unwrap().as_deref(),
            Some("2")
        );

        assert_eq!(store.delete_meta_keys(&["update_count"]).unwrap(), 2);
        assert_eq!(store.get_meta(2, "update_count").unwrap(), None);
        assert_eq!(store.get_meta(2, "other").unwrap().as_deref(), Some("x"));
    }

    #[test]
    fn test_deleting_record_drops_its_meta() {
        let (store, _temp_dir) = create_test_store();
        insert(&store, 1, "post", RecordStatus::Published);
        store.set_meta(1, "update_count", "3").unwrap();

        assert!(store.delete_record(1).unwrap());
        assert_eq!(store.get(1).unwrap(), None);
        assert_eq!(store.get_meta(1, "update_count").unwrap(), None);
    }
}
