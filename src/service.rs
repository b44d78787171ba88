//! The refresher's public surface. The admin CLI and the daemon both go
//! through [`RefresherService`]; components are wired here and nowhere else.

use crate::audit_log::{AuditLog, AuditLogPage, AuditLogQuery};
use crate::clock::{format_local, Clock};
use crate::eligibility::{
    read_counters, read_flag, write_flag, EligibilityFlag, UpdateCounters, ALL_META_KEYS,
};
use crate::engine::{DryRunReport, RefreshEngine, RunRequest, RunResult, RUN_LOCK_NAME};
use crate::error::{ImportError, ServiceError};
use crate::record_store::{
    EligibilityFilter, RecordId, RecordQuery, RecordStatus, RecordStore,
};
use crate::scheduler::{load_registration, RefreshScheduler, REGISTRATION_KEY};
use crate::selector::RecordSelector;
use crate::settings::{Settings, SettingsPatch, SettingsStore, TouchedFields};
use crate::state_store::{RunRecord, StateStore};
use crate::transfer::{
    parse_bundle, records_csv, ExportBundle, ExportFormat, RecordCsvRow, EXPORT_VERSION,
};
use crate::undo::{BulkAction, RevertOutcome, UndoBuffer};
use anyhow::Result;
use chrono::NaiveDateTime;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// UPSERT (`ON CONFLICT .. DO UPDATE`) landed in SQLite 3.24.0.
const MIN_SQLITE_VERSION: i32 = 3_024_000;

#[derive(Debug, Clone, Serialize)]
pub struct RefresherStatus {
    pub enabled: bool,
    pub schedule_time: String,
    pub target_categories: Vec<String>,
    pub batch_size: u32,
    pub fields: TouchedFields,
    pub scheduler_registered: bool,
    pub next_fire_at: Option<NaiveDateTime>,
    pub run_in_progress: bool,
    pub eligible_records: usize,
    pub audit_log_entries: usize,
    pub last_run_at: Option<NaiveDateTime>,
    pub total_updates_applied: u64,
    pub last_run: Option<RunRecord>,
    pub undo_available: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordListQuery {
    pub eligibility: EligibilityFilter,
    pub limit: Option<usize>,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordSummary {
    pub id: RecordId,
    pub title: String,
    pub category: String,
    pub status: RecordStatus,
    pub created_at: NaiveDateTime,
    pub modified_at: NaiveDateTime,
    pub eligibility: EligibilityFlag,
    #[serde(flatten)]
    pub counters: UpdateCounters,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordPage {
    pub items: Vec<RecordSummary>,
    /// Matches before `limit`/`offset` were applied.
    pub total: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkToggleResult {
    pub updated: Vec<RecordId>,
    pub missing: Vec<RecordId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TriggerOutcome {
    Run(RunResult),
    DryRun(DryRunReport),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticsReport {
    pub sqlite_version: String,
    pub scheduler_registered: bool,
    pub next_fire_at: Option<NaiveDateTime>,
    pub eligible_records: usize,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
}

impl DiagnosticsReport {
    pub fn is_healthy(&self) -> bool {
        self.issues.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub settings_imported: bool,
    pub records_enabled: usize,
    pub records_skipped: usize,
    pub logs_imported: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairOptions {
    pub reset_settings: bool,
    pub reschedule: bool,
    pub clear_meta: bool,
}

impl RepairOptions {
    pub fn is_empty(&self) -> bool {
        !self.reset_settings && !self.reschedule && !self.clear_meta
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RescheduleOutcome {
    /// The scheduler in this process re-registered; `None` when refreshing is
    /// disabled and nothing was registered.
    Registered { next_fire_at: Option<NaiveDateTime> },
    /// No scheduler here. The registration mirror was removed so the daemon
    /// re-registers on its next sync.
    Requested,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    pub settings_reset: bool,
    pub reschedule: Option<RescheduleOutcome>,
    pub meta_rows_cleared: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    pub audit_entries_cleared: usize,
    pub meta_rows_cleared: usize,
}

pub struct RefresherService {
    state: Arc<dyn StateStore>,
    records: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    settings: SettingsStore,
    selector: RecordSelector,
    audit_log: AuditLog,
    undo: UndoBuffer,
    engine: Arc<RefreshEngine>,
    scheduler: Option<Arc<RefreshScheduler>>,
}

impl RefresherService {
    pub fn new(
        state: Arc<dyn StateStore>,
        records: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            settings: SettingsStore::new(state.clone()),
            selector: RecordSelector::new(records.clone()),
            audit_log: AuditLog::new(state.clone()),
            undo: UndoBuffer::new(state.clone(), records.clone(), clock.clone()),
            engine: Arc::new(RefreshEngine::new(
                state.clone(),
                records.clone(),
                clock.clone(),
            )),
            scheduler: None,
            state,
            records,
            clock,
        }
    }

    /// Attaches the scheduler that owns this process's timer. Settings
    /// changes then reschedule immediately instead of on the daemon's sync.
    pub fn with_scheduler(mut self, scheduler: Arc<RefreshScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn engine(&self) -> Arc<RefreshEngine> {
        self.engine.clone()
    }

    pub fn get_status(&self) -> Result<RefresherStatus, ServiceError> {
        let settings = self.settings.get()?;
        let registration = load_registration(self.state.as_ref())?;
        let now = self.clock.now();
        let last_run = self.state.get_run_history(1)?.into_iter().next();

        Ok(RefresherStatus {
            enabled: settings.enabled,
            schedule_time: settings.schedule_time.to_string(),
            fields: settings.touched_fields(),
            scheduler_registered: registration.is_some(),
            next_fire_at: registration.map(|r| r.next_fire_after(now)),
            run_in_progress: self.engine.is_running()?,
            eligible_records: self.selector.count_eligible(&settings)?,
            audit_log_entries: self.audit_log.len()?,
            last_run_at: settings.last_run_at,
            total_updates_applied: settings.total_updates_applied,
            last_run,
            undo_available: self.undo.current()?.is_some(),
            batch_size: settings.batch_size,
            target_categories: settings.target_categories,
        })
    }

    pub fn get_settings(&self) -> Result<Settings, ServiceError> {
        Ok(self.settings.get()?)
    }

    pub fn save_settings(&self, patch: SettingsPatch) -> Result<Settings, ServiceError> {
        let before = self.settings.get()?;
        let after = self.settings.save(patch)?;
        self.reschedule_if_changed(&before, &after)?;
        Ok(after)
    }

    fn reschedule_if_changed(&self, before: &Settings, after: &Settings) -> Result<()> {
        let Some(scheduler) = &self.scheduler else {
            return Ok(());
        };
        if before.enabled != after.enabled || before.schedule_time != after.schedule_time {
            scheduler.reschedule(after)?;
        }
        Ok(())
    }

    /// Published records in the target categories, with their flag and
    /// counters.
    pub fn list_records(&self, query: &RecordListQuery) -> Result<RecordPage, ServiceError> {
        let settings = self.settings.get()?;
        let ids = self.records.query(&RecordQuery {
            categories: settings.target_categories.clone(),
            status: Some(RecordStatus::Published),
            eligibility: query.eligibility,
        })?;

        let total = ids.len();
        let page = ids
            .into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX));
        let mut items = Vec::new();
        for id in page {
            // Deleted between query and get.
            let Some(record) = self.records.get(id)? else {
                continue;
            };
            items.push(RecordSummary {
                eligibility: read_flag(self.records.as_ref(), id)?,
                counters: read_counters(self.records.as_ref(), id)?,
                id,
                title: record.title,
                category: record.category,
                status: record.status,
                created_at: record.created.local,
                modified_at: record.modified.local,
            });
        }
        Ok(RecordPage { items, total })
    }

    pub fn toggle_eligibility(&self, id: RecordId, enabled: bool) -> Result<(), ServiceError> {
        if self.records.get(id)?.is_none() {
            return Err(ServiceError::RecordNotFound(id));
        }
        write_flag(self.records.as_ref(), id, enabled)?;
        info!(record_id = id, enabled, "Eligibility changed");
        Ok(())
    }

    /// Sets the flag on every existing id and remembers them for
    /// [`RefresherService::revert_last_bulk_action`]. Unknown ids are
    /// reported, not fatal.
    pub fn bulk_toggle(
        &self,
        ids: &[RecordId],
        enabled: bool,
    ) -> Result<BulkToggleResult, ServiceError> {
        let mut result = BulkToggleResult::default();
        for &id in ids {
            if result.updated.contains(&id) || result.missing.contains(&id) {
                continue;
            }
            if self.records.get(id)?.is_none() {
                result.missing.push(id);
                continue;
            }
            write_flag(self.records.as_ref(), id, enabled)?;
            result.updated.push(id);
        }

        if !result.updated.is_empty() {
            self.undo
                .capture(BulkAction::from_enabled(enabled), result.updated.clone())?;
        }
        info!(
            enabled,
            updated = result.updated.len(),
            missing = result.missing.len(),
            "Bulk eligibility change"
        );
        Ok(result)
    }

    /// Bulk toggle over every published record in the target categories.
    pub fn set_all_eligibility(&self, enabled: bool) -> Result<BulkToggleResult, ServiceError> {
        let settings = self.settings.get()?;
        let ids = self.records.query(&RecordQuery {
            categories: settings.target_categories,
            status: Some(RecordStatus::Published),
            eligibility: EligibilityFilter::Any,
        })?;
        self.bulk_toggle(&ids, enabled)
    }

    pub fn enable_all(&self) -> Result<BulkToggleResult, ServiceError> {
        self.set_all_eligibility(true)
    }

    pub fn disable_all(&self) -> Result<BulkToggleResult, ServiceError> {
        self.set_all_eligibility(false)
    }

    pub fn trigger_run(
        &self,
        force: bool,
        dry_run: bool,
        batch_size_override: Option<u32>,
    ) -> Result<TriggerOutcome, ServiceError> {
        if dry_run {
            let report = self.engine.dry_run(force, batch_size_override)?;
            return Ok(TriggerOutcome::DryRun(report));
        }
        let result = self
            .engine
            .run(&RunRequest::manual(force, batch_size_override))?;
        Ok(TriggerOutcome::Run(result))
    }

    pub fn list_audit_log(&self, query: &AuditLogQuery) -> Result<AuditLogPage, ServiceError> {
        Ok(self.audit_log.list(query)?)
    }

    pub fn clear_audit_log(&self) -> Result<usize, ServiceError> {
        let removed = self.audit_log.clear()?;
        info!(removed, "Audit log cleared");
        Ok(removed)
    }

    pub fn export_audit_log_csv(&self) -> Result<Vec<u8>, ServiceError> {
        Ok(self.audit_log.export_csv()?)
    }

    pub fn revert_last_bulk_action(&self) -> Result<RevertOutcome, ServiceError> {
        Ok(self.undo.revert()?)
    }

    pub fn diagnostics(&self) -> Result<DiagnosticsReport, ServiceError> {
        let settings = self.settings.get()?;
        let registration = load_registration(self.state.as_ref())?;
        let mut report = DiagnosticsReport {
            sqlite_version: rusqlite::version().to_string(),
            scheduler_registered: registration.is_some(),
            next_fire_at: registration
                .as_ref()
                .map(|r| r.next_fire_after(self.clock.now())),
            eligible_records: self.selector.count_eligible(&settings)?,
            ..Default::default()
        };

        if settings.enabled && registration.is_none() {
            report
                .issues
                .push("Refreshing is enabled but no daily run is scheduled".to_string());
        }
        if rusqlite::version_number() < MIN_SQLITE_VERSION {
            report.issues.push(format!(
                "SQLite {} is too old, 3.24.0 or newer is required",
                report.sqlite_version
            ));
        }

        if !settings.enabled {
            report
                .warnings
                .push("Refreshing is disabled, scheduled runs do nothing".to_string());
        }
        if report.eligible_records == 0 {
            report
                .warnings
                .push("No records are marked for refreshing".to_string());
        }
        if !settings.touch_creation_timestamp && !settings.touch_modification_timestamp {
            report.warnings.push(
                "No timestamp field is selected, runs will touch the creation timestamp"
                    .to_string(),
            );
        }
        Ok(report)
    }

    pub fn export(&self, format: ExportFormat) -> Result<Vec<u8>, ServiceError> {
        let ids = self.records.query(&RecordQuery {
            eligibility: EligibilityFilter::Enabled,
            ..Default::default()
        })?;

        match format {
            ExportFormat::Json => {
                let bundle = ExportBundle {
                    version: EXPORT_VERSION.to_string(),
                    export_date: format_local(&self.clock.now()),
                    settings: Some(self.settings.get()?),
                    enabled_records: ids,
                    logs: Some(self.audit_log.entries()?),
                };
                Ok(bundle.to_json()?)
            }
            ExportFormat::Csv => {
                let mut rows = Vec::with_capacity(ids.len());
                for id in ids {
                    let Some(record) = self.records.get(id)? else {
                        continue;
                    };
                    let counters = read_counters(self.records.as_ref(), id)?;
                    rows.push(RecordCsvRow {
                        record_id: id,
                        title: record.title,
                        category: record.category,
                        created: format_local(&record.created.local),
                        last_update: counters.last_auto_update,
                        update_count: counters.update_count,
                    });
                }
                Ok(records_csv(&rows)?)
            }
        }
    }

    /// Applies an exported bundle. The whole payload is validated first.
    /// Without `merge`, settings and the audit log are replaced; with it,
    /// settings are kept and logs are merged. Listed records are enabled when
    /// they exist; no record is ever disabled by an import.
    pub fn import(&self, bytes: &[u8], merge: bool) -> Result<ImportSummary, ServiceError> {
        let bundle = parse_bundle(bytes)?;
        let mut summary = ImportSummary::default();

        if let (false, Some(settings)) = (merge, bundle.settings) {
            let before = self.settings.get().map_err(ImportError::Store)?;
            let after = self.settings.replace(settings).map_err(ImportError::Store)?;
            self.reschedule_if_changed(&before, &after)
                .map_err(ImportError::Store)?;
            summary.settings_imported = true;
        }

        for id in bundle.enabled_records {
            if self.records.get(id).map_err(ImportError::Store)?.is_none() {
                warn!(record_id = id, "Import skipping unknown record");
                summary.records_skipped += 1;
                continue;
            }
            write_flag(self.records.as_ref(), id, true).map_err(ImportError::Store)?;
            summary.records_enabled += 1;
        }

        if let Some(logs) = bundle.logs {
            let kept = if merge {
                self.audit_log.merge(logs)
            } else {
                self.audit_log.replace_all(logs)
            }
            .map_err(ImportError::Store)?;
            summary.logs_imported = Some(kept);
        }

        info!(
            merge,
            settings = summary.settings_imported,
            enabled = summary.records_enabled,
            skipped = summary.records_skipped,
            "Import applied"
        );
        Ok(summary)
    }

    pub fn repair(&self, options: RepairOptions) -> Result<RepairReport, ServiceError> {
        let mut report = RepairReport::default();

        if options.reset_settings {
            self.settings.reset()?;
            report.settings_reset = true;
            info!("Settings reset to defaults");
        }

        if options.reschedule {
            let outcome = match &self.scheduler {
                Some(scheduler) => {
                    let settings = self.settings.get()?;
                    let registration = scheduler.reschedule(&settings)?;
                    RescheduleOutcome::Registered {
                        next_fire_at: registration.map(|r| r.first_fire_at),
                    }
                }
                None => {
                    self.state.delete_state(REGISTRATION_KEY)?;
                    RescheduleOutcome::Requested
                }
            };
            report.reschedule = Some(outcome);
        }

        if options.clear_meta {
            let removed = self.records.delete_meta_keys(ALL_META_KEYS)?;
            info!(removed, "Refresher metadata cleared");
            report.meta_rows_cleared = Some(removed);
        }

        Ok(report)
    }

    /// Removes everything the refresher stored: settings, undo buffer, audit
    /// log, registration, lock and per-record metadata. Refused while a run
    /// holds the lock.
    pub fn teardown(&self) -> Result<TeardownReport, ServiceError> {
        if self.engine.is_running()? {
            return Err(ServiceError::RunInProgress);
        }
        match &self.scheduler {
            Some(scheduler) => scheduler.cancel()?,
            None => self.state.delete_state(REGISTRATION_KEY)?,
        }
        self.settings.reset()?;
        self.undo.discard()?;
        self.state.release_lock(RUN_LOCK_NAME)?;

        let report = TeardownReport {
            audit_entries_cleared: self.audit_log.clear()?,
            meta_rows_cleared: self.records.delete_meta_keys(ALL_META_KEYS)?,
        };
        info!(
            audit_entries = report.audit_entries_cleared,
            meta_rows = report.meta_rows_cleared,
            "Refresher data removed"
        );
        Ok(report)
    }

    pub fn run_history(&self, limit: usize) -> Result<Vec<RunRecord>, ServiceError> {
        Ok(self.state.get_run_history(limit)?)
    }
}
