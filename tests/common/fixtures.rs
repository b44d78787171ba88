//! Stores on temporary SQLite files, a manual clock and a service wired to them.

use super::constants::*;
use chrono::{Duration, NaiveDate, NaiveDateTime};
use daily_refresher::clock::ManualClock;
use daily_refresher::eligibility::{read_counters, read_flag, EligibilityFlag, UpdateCounters};
use daily_refresher::engine::RefreshEngine;
use daily_refresher::record_store::{
    NewRecord, RecordId, RecordStatus, RecordStore, SqliteRecordStore, TimestampPair,
};
use daily_refresher::service::RefresherService;
use daily_refresher::settings::{Settings, SettingsPatch};
use daily_refresher::state_store::SqliteStateStore;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

/// 2024-04-01 10:00:00, the test clock's initial reading.
pub fn start_time() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 4, 1)
        .unwrap()
        .and_hms_opt(10, 0, 0)
        .unwrap()
}

pub struct TestEnv {
    pub dir: TempDir,
    pub state: Arc<SqliteStateStore>,
    pub records: Arc<SqliteRecordStore>,
    pub clock: Arc<ManualClock>,
    pub service: RefresherService,
}

#[allow(dead_code)]
impl TestEnv {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let state = Arc::new(SqliteStateStore::new(dir.path().join("state.db")).unwrap());
        let records = Arc::new(SqliteRecordStore::new(dir.path().join("records.db")).unwrap());
        let clock = Arc::new(ManualClock::new(start_time()));
        let service = RefresherService::new(state.clone(), records.clone(), clock.clone());
        Self {
            dir,
            state,
            records,
            clock,
            service,
        }
    }

    pub fn state_db_path(&self) -> PathBuf {
        self.dir.path().join("state.db")
    }

    /// A second engine over the same files, through its own connections, as
    /// another process would see them.
    pub fn second_process_engine(&self) -> RefreshEngine {
        let state = Arc::new(SqliteStateStore::new(self.state_db_path()).unwrap());
        let records = Arc::new(SqliteRecordStore::new(self.dir.path().join("records.db")).unwrap());
        RefreshEngine::new(state, records, self.clock.clone())
    }

    /// An engine over this env's state store and the given record store.
    pub fn engine_with_records(&self, records: Arc<dyn RecordStore>) -> RefreshEngine {
        RefreshEngine::new(self.state.clone(), records, self.clock.clone())
    }

    pub fn add_record(&self, id: RecordId, category: &str, status: RecordStatus) {
        let ts = start_time() - Duration::days(RECORD_AGE_DAYS) + Duration::minutes(id);
        let pair = TimestampPair {
            local: ts,
            utc: ts.and_utc(),
        };
        self.records
            .insert_record(&NewRecord {
                id: Some(id),
                title: format!("Record {}", id),
                category: category.to_string(),
                status,
                created: pair,
                modified: pair,
            })
            .unwrap();
    }

    pub fn add_published(&self, ids: &[RecordId], category: &str) {
        for &id in ids {
            self.add_record(id, category, RecordStatus::Published);
        }
    }

    /// Published `post` records, flagged eligible.
    pub fn add_eligible(&self, ids: &[RecordId]) {
        self.add_published(ids, POST);
        self.service.bulk_toggle(ids, true).unwrap();
    }

    pub fn configure(&self, patch: SettingsPatch) -> Settings {
        self.service.save_settings(patch).unwrap()
    }

    pub fn enable_with_batch(&self, batch_size: u32) -> Settings {
        self.configure(SettingsPatch {
            enabled: Some(true),
            batch_size: Some(batch_size),
            ..Default::default()
        })
    }

    pub fn flag(&self, id: RecordId) -> EligibilityFlag {
        read_flag(self.records.as_ref(), id).unwrap()
    }

    pub fn counters(&self, id: RecordId) -> UpdateCounters {
        read_counters(self.records.as_ref(), id).unwrap()
    }

    pub fn created_at(&self, id: RecordId) -> NaiveDateTime {
        self.records.get(id).unwrap().unwrap().created.local
    }

    pub fn modified_at(&self, id: RecordId) -> NaiveDateTime {
        self.records.get(id).unwrap().unwrap().modified.local
    }
}
