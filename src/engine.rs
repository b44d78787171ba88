//! The refresh run: single-flight, bounded batch, per-record fault tolerance.
//!
//! A run loads settings, takes the run lock, selects eligible records,
//! rewrites the configured timestamp field(s) on at most `batch_size` of them
//! and records each change in the audit log. A record that cannot be updated
//! is counted as failed and the run moves on. The lock lives in the state
//! store with a one hour expiry, so a crashed run cannot wedge the refresher.

use crate::audit_log::AuditLog;
use crate::clock::Clock;
use crate::eligibility::bump_counters;
use crate::error::EngineError;
use crate::metrics;
use crate::record_store::{RecordId, RecordStore, TimestampPair, TimestampUpdate};
use crate::selector::RecordSelector;
use crate::settings::{clamp_batch_size, Settings, SettingsStore, TouchedFields};
use crate::state_store::{AuditLogEntry, RunCompletion, RunStatus, RunTrigger, StateStore};
use anyhow::Result;
use chrono::{Duration, NaiveDateTime};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

pub const RUN_LOCK_NAME: &str = "refresh_run";
pub const RUN_LOCK_TTL_SECS: i64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Disabled,
    AlreadyRunning,
    NoEligibleRecords,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Completed => "completed",
            RunOutcome::Disabled => "disabled",
            RunOutcome::AlreadyRunning => "already running",
            RunOutcome::NoEligibleRecords => "no eligible records",
        }
    }

    fn metric_label(&self) -> &'static str {
        match self {
            RunOutcome::Completed => "completed",
            RunOutcome::Disabled => "disabled",
            RunOutcome::AlreadyRunning => "already_running",
            RunOutcome::NoEligibleRecords => "no_eligible_records",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunRequest {
    /// Run even when refreshing is disabled.
    pub force: bool,
    pub batch_size_override: Option<u32>,
    pub trigger: RunTrigger,
}

impl RunRequest {
    pub fn scheduled() -> Self {
        Self {
            force: false,
            batch_size_override: None,
            trigger: RunTrigger::Schedule,
        }
    }

    pub fn manual(force: bool, batch_size_override: Option<u32>) -> Self {
        Self {
            force,
            batch_size_override,
            trigger: RunTrigger::Manual,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunResult {
    /// True once a batch was attempted, even if every record in it failed.
    pub success: bool,
    pub outcome: RunOutcome,
    pub records_updated: usize,
    pub records_failed: usize,
    pub message: String,
    pub detail_log: Vec<String>,
}

impl RunResult {
    fn skipped(outcome: RunOutcome) -> Self {
        Self {
            success: false,
            outcome,
            records_updated: 0,
            records_failed: 0,
            message: outcome.as_str().to_string(),
            detail_log: Vec::new(),
        }
    }
}

/// What a real run would do to one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedUpdate {
    pub record_id: RecordId,
    pub title: String,
    pub old_timestamp: NaiveDateTime,
    pub new_timestamp: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DryRunReport {
    pub outcome: RunOutcome,
    pub eligible_total: usize,
    pub fields: TouchedFields,
    pub planned: Vec<PlannedUpdate>,
    pub message: String,
}

enum RecordOutcome {
    Updated,
    Missing,
    Rejected,
}

/// Holds the run lock; releases it when dropped.
struct RunLockGuard<'a> {
    state: &'a dyn StateStore,
}

impl<'a> RunLockGuard<'a> {
    fn acquire(state: &'a dyn StateStore, clock: &dyn Clock) -> Result<Option<Self>> {
        let ttl = Duration::seconds(RUN_LOCK_TTL_SECS);
        if !state.try_acquire_lock(RUN_LOCK_NAME, ttl, clock.now_utc())? {
            return Ok(None);
        }
        metrics::set_run_in_progress(true);
        Ok(Some(Self { state }))
    }
}

impl Drop for RunLockGuard<'_> {
    fn drop(&mut self) {
        metrics::set_run_in_progress(false);
        if let Err(e) = self.state.release_lock(RUN_LOCK_NAME) {
            error!("Failed to release run lock: {}", e);
        }
    }
}

pub struct RefreshEngine {
    state: Arc<dyn StateStore>,
    records: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    settings: SettingsStore,
    selector: RecordSelector,
    audit_log: AuditLog,
}

impl RefreshEngine {
    pub fn new(
        state: Arc<dyn StateStore>,
        records: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            settings: SettingsStore::new(state.clone()),
            selector: RecordSelector::new(records.clone()),
            audit_log: AuditLog::new(state.clone()),
            state,
            records,
            clock,
        }
    }

    /// Whether some process currently holds an unexpired run lock.
    pub fn is_running(&self) -> Result<bool> {
        Ok(self
            .state
            .lock_expires_at(RUN_LOCK_NAME, self.clock.now_utc())?
            .is_some())
    }

    /// Marks history rows left `running` by a process that exited mid-run as
    /// failed. Nothing is touched while the run lock is live, since that run
    /// may still be going in another process.
    pub fn fail_interrupted_runs(&self) -> Result<usize> {
        if self.is_running()? {
            info!("Run lock is held, leaving in-progress history rows alone");
            return Ok(0);
        }
        self.state.mark_stale_runs_failed(self.clock.now_utc())
    }

    pub fn run(&self, request: &RunRequest) -> Result<RunResult, EngineError> {
        let trigger = request.trigger.as_str();
        let settings = self.settings.get()?;
        if !request.force && !settings.enabled {
            debug!(trigger, "Refresh skipped, refreshing is disabled");
            metrics::record_run(trigger, RunOutcome::Disabled.metric_label());
            return Ok(RunResult::skipped(RunOutcome::Disabled));
        }

        let Some(_lock) = RunLockGuard::acquire(self.state.as_ref(), self.clock.as_ref())? else {
            info!(trigger, "Refresh skipped, another run is in progress");
            metrics::record_run(trigger, RunOutcome::AlreadyRunning.metric_label());
            return Ok(RunResult::skipped(RunOutcome::AlreadyRunning));
        };

        let started = Instant::now();
        let run_id = self
            .state
            .record_run_start(request.trigger, self.clock.now_utc())?;
        info!(run_id, trigger, force = request.force, "Refresh run started");

        let result = self.run_locked(&settings, request);

        let completion = match &result {
            Ok(run) => RunCompletion {
                status: RunStatus::Completed,
                records_updated: run.records_updated,
                records_failed: run.records_failed,
                message: run.message.clone(),
                finished_at: self.clock.now_utc(),
            },
            Err(e) => RunCompletion {
                status: RunStatus::Failed,
                records_updated: 0,
                records_failed: 0,
                message: e.to_string(),
                finished_at: self.clock.now_utc(),
            },
        };
        if let Err(e) = self.state.record_run_finish(run_id, &completion) {
            warn!(run_id, "Failed to record run completion: {}", e);
        }

        match &result {
            Ok(run) => {
                metrics::record_run(trigger, run.outcome.metric_label());
                if run.outcome == RunOutcome::Completed {
                    metrics::record_batch(run.records_updated, run.records_failed, started.elapsed());
                }
                info!(
                    run_id,
                    updated = run.records_updated,
                    failed = run.records_failed,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Refresh run finished: {}",
                    run.message
                );
            }
            Err(e) => {
                metrics::record_run(trigger, "error");
                error!(run_id, "Refresh run failed: {}", e);
            }
        }
        result
    }

    fn run_locked(&self, settings: &Settings, request: &RunRequest) -> Result<RunResult, EngineError> {
        let ids = self.selector.select(settings)?;
        if ids.is_empty() {
            return Ok(RunResult::skipped(RunOutcome::NoEligibleRecords));
        }

        let limit = effective_batch_size(settings, request.batch_size_override);
        let batch = &ids[..limit.min(ids.len())];
        let fields = settings.touched_fields();
        if !settings.touch_creation_timestamp && !settings.touch_modification_timestamp {
            warn!("No timestamp field selected, touching the creation timestamp");
        }

        let mut records_updated = 0;
        let mut records_failed = 0;
        let mut detail_log = Vec::with_capacity(batch.len());
        for &id in batch {
            match self.refresh_record(id, fields) {
                Ok(RecordOutcome::Updated) => {
                    records_updated += 1;
                    detail_log.push(format!("Record {}: updated", id));
                }
                Ok(RecordOutcome::Missing) => {
                    records_failed += 1;
                    warn!(record_id = id, "Record disappeared before it could be updated");
                    detail_log.push(format!("Record {}: not found", id));
                }
                Ok(RecordOutcome::Rejected) => {
                    records_failed += 1;
                    warn!(record_id = id, "Record store rejected the timestamp update");
                    detail_log.push(format!("Record {}: update rejected", id));
                }
                Err(e) => {
                    records_failed += 1;
                    warn!(record_id = id, "Failed to update record: {}", e);
                    detail_log.push(format!("Record {}: {}", id, e));
                }
            }
        }

        self.settings
            .record_run_stats(records_updated, self.clock.now())?;

        let message = if records_failed > 0 {
            format!(
                "Updated {} of {}; {} failed",
                records_updated,
                batch.len(),
                records_failed
            )
        } else {
            format!("Updated {} of {}", records_updated, batch.len())
        };
        Ok(RunResult {
            success: true,
            outcome: RunOutcome::Completed,
            records_updated,
            records_failed,
            message,
            detail_log,
        })
    }

    fn refresh_record(&self, id: RecordId, fields: TouchedFields) -> Result<RecordOutcome> {
        let Some(record) = self.records.get(id)? else {
            return Ok(RecordOutcome::Missing);
        };

        let now = self.clock.now();
        let stamp = TimestampPair {
            local: now,
            utc: self.clock.now_utc(),
        };
        let update = TimestampUpdate {
            created: fields.creation.then_some(stamp),
            modified: fields.modification.then_some(stamp),
        };
        if !self.records.apply_timestamps(id, &update)? {
            return Ok(RecordOutcome::Rejected);
        }

        // The record is updated at this point; bookkeeping failures are logged
        // but do not turn it into a failure.
        if let Err(e) = bump_counters(self.records.as_ref(), id, &now) {
            warn!(record_id = id, "Failed to update record counters: {}", e);
        }
        let entry = AuditLogEntry {
            record_id: id,
            record_title: record.title,
            old_timestamp: old_timestamp(&record.created, &record.modified, fields),
            new_timestamp: now,
            applied_at: now,
        };
        if let Err(e) = self.audit_log.append(&entry) {
            warn!(record_id = id, "Failed to append audit log entry: {}", e);
        }
        debug!(record_id = id, "Record refreshed");
        Ok(RecordOutcome::Updated)
    }

    /// Computes what [`RefreshEngine::run`] would change, without taking the
    /// lock or writing anything.
    pub fn dry_run(
        &self,
        force: bool,
        batch_size_override: Option<u32>,
    ) -> Result<DryRunReport, EngineError> {
        let settings = self.settings.get()?;
        let fields = settings.touched_fields();
        if !force && !settings.enabled {
            return Ok(DryRunReport {
                outcome: RunOutcome::Disabled,
                eligible_total: 0,
                fields,
                planned: Vec::new(),
                message: RunOutcome::Disabled.as_str().to_string(),
            });
        }

        let ids = self.selector.select(&settings)?;
        if ids.is_empty() {
            return Ok(DryRunReport {
                outcome: RunOutcome::NoEligibleRecords,
                eligible_total: 0,
                fields,
                planned: Vec::new(),
                message: RunOutcome::NoEligibleRecords.as_str().to_string(),
            });
        }

        let limit = effective_batch_size(&settings, batch_size_override);
        let now = self.clock.now();
        let mut planned = Vec::new();
        for &id in &ids[..limit.min(ids.len())] {
            match self.records.get(id) {
                Ok(Some(record)) => planned.push(PlannedUpdate {
                    record_id: id,
                    old_timestamp: old_timestamp(&record.created, &record.modified, fields),
                    title: record.title,
                    new_timestamp: now,
                }),
                Ok(None) => debug!(record_id = id, "Dry run skipping missing record"),
                Err(e) => warn!(record_id = id, "Dry run skipping unreadable record: {}", e),
            }
        }

        let message = format!(
            "Would update {} of {} eligible records",
            planned.len(),
            ids.len()
        );
        Ok(DryRunReport {
            outcome: RunOutcome::Completed,
            eligible_total: ids.len(),
            fields,
            planned,
            message,
        })
    }
}

fn effective_batch_size(settings: &Settings, batch_size_override: Option<u32>) -> usize {
    batch_size_override
        .map(clamp_batch_size)
        .unwrap_or(settings.batch_size) as usize
}

/// The value the audit log reports as replaced: the creation timestamp when
/// that field is touched, otherwise the modification timestamp.
fn old_timestamp(
    created: &TimestampPair,
    modified: &TimestampPair,
    fields: TouchedFields,
) -> NaiveDateTime {
    if fields.creation {
        created.local
    } else {
        modified.local
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::eligibility::{read_counters, write_flag};
    use crate::record_store::{NewRecord, RecordStatus, SqliteRecordStore};
    use crate::settings::SettingsPatch;
    use crate::state_store::SqliteStateStore;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    struct Fixture {
        engine: RefreshEngine,
        state: Arc<SqliteStateStore>,
        records: Arc<SqliteRecordStore>,
        clock: Arc<ManualClock>,
        _temp_dir: TempDir,
    }

    fn old_time() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2023, 1, 1)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap()
    }

    fn now_time() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(3, 0, 0)
            .unwrap()
    }

    fn fixture(eligible: &[RecordId]) -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let state = Arc::new(SqliteStateStore::new(temp_dir.path().join("state.db")).unwrap());
        let records =
            Arc::new(SqliteRecordStore::new(temp_dir.path().join("records.db")).unwrap());
        let clock = Arc::new(ManualClock::new(now_time()));
        for &id in eligible {
            let created = TimestampPair {
                local: old_time(),
                utc: old_time().and_utc(),
            };
            let modified = TimestampPair {
                local: old_time() + Duration::days(1),
                utc: (old_time() + Duration::days(1)).and_utc(),
            };
            records
                .insert_record(&NewRecord {
                    id: Some(id),
                    title: format!("Record {}", id),
                    category: "post".to_string(),
                    status: RecordStatus::Published,
                    created,
                    modified,
                })
                .unwrap();
            write_flag(records.as_ref(), id, true).unwrap();
        }
        let engine = RefreshEngine::new(state.clone(), records.clone(), clock.clone());
        Fixture {
            engine,
            state,
            records,
            clock,
            _temp_dir: temp_dir,
        }
    }

    fn enable(f: &Fixture, patch: SettingsPatch) {
        SettingsStore::new(f.state.clone())
            .save(SettingsPatch {
                enabled: Some(true),
                ..patch
            })
            .unwrap();
    }

    #[test]
    fn test_run_updates_batch_in_id_order() {
        let f = fixture(&[103, 101, 102]);
        enable(
            &f,
            SettingsPatch {
                batch_size: Some(2),
                ..Default::default()
            },
        );

        let result = f.engine.run(&RunRequest::scheduled()).unwrap();
        assert!(result.success);
        assert_eq!(result.outcome, RunOutcome::Completed);
        assert_eq!(result.records_updated, 2);
        assert_eq!(result.message, "Updated 2 of 2");

        assert_eq!(f.records.get(101).unwrap().unwrap().created.local, now_time());
        assert_eq!(f.records.get(102).unwrap().unwrap().created.local, now_time());
        assert_eq!(f.records.get(103).unwrap().unwrap().created.local, old_time());
        let counters = read_counters(f.records.as_ref(), 101).unwrap();
        assert_eq!(counters.update_count, 1);
        assert_eq!(counters.last_auto_update.as_deref(), Some("2024-06-01 03:00:00"));

        let settings = SettingsStore::new(f.state.clone()).get().unwrap();
        assert_eq!(settings.total_updates_applied, 2);
        assert_eq!(settings.last_run_at, Some(now_time()));
        assert!(!f.engine.is_running().unwrap());
    }

    #[test]
    fn test_disabled_run_touches_nothing() {
        let f = fixture(&[1]);
        let result = f.engine.run(&RunRequest::scheduled()).unwrap();
        assert!(!result.success);
        assert_eq!(result.message, "disabled");
        assert_eq!(f.records.get(1).unwrap().unwrap().created.local, old_time());
        assert!(f.state.get_run_history(10).unwrap().is_empty());
    }

    #[test]
    fn test_forced_run_ignores_disabled_flag() {
        let f = fixture(&[1]);
        let result = f.engine.run(&RunRequest::manual(true, None)).unwrap();
        assert!(result.success);
        assert_eq!(result.records_updated, 1);
    }

    #[test]
    fn test_held_lock_reports_already_running() {
        let f = fixture(&[1]);
        enable(&f, SettingsPatch::default());
        f.state
            .try_acquire_lock(RUN_LOCK_NAME, Duration::hours(1), f.clock.now_utc())
            .unwrap();

        let result = f.engine.run(&RunRequest::scheduled()).unwrap();
        assert!(!result.success);
        assert_eq!(result.message, "already running");
        assert_eq!(f.records.get(1).unwrap().unwrap().created.local, old_time());
    }

    #[test]
    fn test_stale_lock_expires_after_an_hour() {
        let f = fixture(&[1]);
        enable(&f, SettingsPatch::default());
        f.state
            .try_acquire_lock(RUN_LOCK_NAME, Duration::hours(1), f.clock.now_utc())
            .unwrap();

        f.clock.advance(Duration::minutes(61));
        let result = f.engine.run(&RunRequest::scheduled()).unwrap();
        assert_eq!(result.outcome, RunOutcome::Completed);
    }

    #[test]
    fn test_no_eligible_records() {
        let f = fixture(&[]);
        enable(&f, SettingsPatch::default());
        let result = f.engine.run(&RunRequest::scheduled()).unwrap();
        assert!(!result.success);
        assert_eq!(result.message, "no eligible records");
        assert!(!f.engine.is_running().unwrap());
    }

    #[test]
    fn test_modification_only_logs_old_modification_time() {
        let f = fixture(&[1]);
        enable(
            &f,
            SettingsPatch {
                touch_creation_timestamp: Some(false),
                touch_modification_timestamp: Some(true),
                ..Default::default()
            },
        );

        f.engine.run(&RunRequest::scheduled()).unwrap();
        let record = f.records.get(1).unwrap().unwrap();
        assert_eq!(record.created.local, old_time());
        assert_eq!(record.modified.local, now_time());

        let entries = AuditLog::new(f.state.clone()).entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].old_timestamp, old_time() + Duration::days(1));
        assert_eq!(entries[0].new_timestamp, now_time());
    }

    #[test]
    fn test_batch_size_override_is_clamped() {
        let f = fixture(&[1, 2, 3]);
        enable(&f, SettingsPatch::default());
        let result = f.engine.run(&RunRequest::manual(false, Some(0))).unwrap();
        assert_eq!(result.records_updated, 1);
    }

    #[test]
    fn test_run_history_is_recorded() {
        let f = fixture(&[1, 2]);
        enable(&f, SettingsPatch::default());
        f.engine.run(&RunRequest::manual(false, None)).unwrap();

        let history = f.state.get_run_history(5).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, RunStatus::Completed);
        assert_eq!(history[0].triggered_by, RunTrigger::Manual);
        assert_eq!(history[0].records_updated, 2);
        assert_eq!(history[0].message.as_deref(), Some("Updated 2 of 2"));
    }

    #[test]
    fn test_dry_run_reports_plan_without_writing() {
        let f = fixture(&[1, 2, 3]);
        enable(
            &f,
            SettingsPatch {
                batch_size: Some(2),
                ..Default::default()
            },
        );

        let report = f.engine.dry_run(false, None).unwrap();
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.eligible_total, 3);
        let ids: Vec<RecordId> = report.planned.iter().map(|p| p.record_id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(report.planned[0].old_timestamp, old_time());
        assert_eq!(report.planned[0].new_timestamp, now_time());

        assert_eq!(f.records.get(1).unwrap().unwrap().created.local, old_time());
        assert!(AuditLog::new(f.state.clone()).is_empty().unwrap());
        assert!(f.state.get_run_history(5).unwrap().is_empty());
    }

    #[test]
    fn test_dry_run_respects_disabled_unless_forced() {
        let f = fixture(&[1]);
        assert_eq!(
            f.engine.dry_run(false, None).unwrap().outcome,
            RunOutcome::Disabled
        );
        assert_eq!(f.engine.dry_run(true, None).unwrap().planned.len(), 1);
    }
}
