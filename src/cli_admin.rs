use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod cli_style;

use cli_style::{colors, get_styles, TableBuilder};

use daily_refresher::audit_log::{AuditLogQuery, DEFAULT_PAGE_SIZE};
use daily_refresher::clock::{format_local, Clock, SystemClock};
use daily_refresher::config;
use daily_refresher::engine::RunOutcome;
use daily_refresher::record_store::{EligibilityFilter, RecordId, SqliteRecordStore};
use daily_refresher::service::{
    BulkToggleResult, RecordListQuery, RefresherService, RepairOptions, RescheduleOutcome,
    TriggerOutcome,
};
use daily_refresher::settings::{ScheduleTime, SettingsPatch};
use daily_refresher::state_store::SqliteStateStore;
use daily_refresher::transfer::ExportFormat;

fn parse_path(s: &str) -> Result<PathBuf, String> {
    let original_path = PathBuf::from(s);
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir().map_err(|e| format!("Failed to get current dir: {}", e))?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
#[command(styles = get_styles(), name = "refresher-cli", version)]
struct CliArgs {
    #[command(flatten)]
    location: StoreLocation,

    #[command(subcommand)]
    command: Command,
}

/// Where to find the databases. Resolved the same way as the daemon.
#[derive(Args, Debug)]
struct StoreLocation {
    /// Path to the daemon's TOML configuration file.
    #[clap(long, global = true, value_parser = parse_path)]
    config: Option<PathBuf>,

    /// Directory holding state.db.
    #[clap(long, global = true, value_parser = parse_path)]
    db_dir: Option<PathBuf>,

    /// Record store database. Relative paths are resolved against db_dir.
    #[clap(long, global = true)]
    records_db: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ListFormat {
    Table,
    Csv,
    Json,
    Count,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Table,
    /// The whole log, oldest first. Filters are ignored.
    Csv,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EligibilityArg {
    Enabled,
    Disabled,
    All,
}

impl From<EligibilityArg> for EligibilityFilter {
    fn from(arg: EligibilityArg) -> Self {
        match arg {
            EligibilityArg::Enabled => EligibilityFilter::Enabled,
            EligibilityArg::Disabled => EligibilityFilter::Disabled,
            EligibilityArg::All => EligibilityFilter::Any,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Shows settings, schedule and the last run.
    Status {
        #[clap(long, value_enum, default_value = "table")]
        format: OutputFormat,
    },

    /// Lists published records in the target categories.
    List {
        #[clap(long, value_enum, default_value = "all")]
        status: EligibilityArg,
        #[clap(long)]
        limit: Option<usize>,
        #[clap(long, default_value_t = 0)]
        offset: usize,
        #[clap(long, value_enum, default_value = "table")]
        format: ListFormat,
    },

    /// Marks records for refreshing. Can be undone for five minutes.
    Enable {
        #[clap(required_unless_present = "all", conflicts_with = "all")]
        ids: Vec<RecordId>,
        /// Every published record in the target categories.
        #[clap(long)]
        all: bool,
    },

    /// Unmarks records. Can be undone for five minutes.
    Disable {
        #[clap(required_unless_present = "all", conflicts_with = "all")]
        ids: Vec<RecordId>,
        #[clap(long)]
        all: bool,
    },

    /// Reverts the last enable/disable.
    Undo,

    /// Runs a refresh now.
    Trigger {
        /// Only show what would change.
        #[clap(long)]
        dry_run: bool,
        #[clap(long)]
        batch_size: Option<u32>,
        /// Skip the run when refreshing is disabled, like a scheduled run.
        #[clap(long)]
        respect_enabled: bool,
    },

    /// Shows the audit log, newest first.
    Logs {
        #[clap(long, default_value_t = DEFAULT_PAGE_SIZE)]
        limit: usize,
        #[clap(long, default_value_t = 0)]
        offset: usize,
        #[clap(long, alias = "post-id")]
        record_id: Option<RecordId>,
        #[clap(long, value_enum, default_value = "table")]
        format: LogFormat,
    },

    /// Deletes every audit log entry.
    ClearLogs {
        #[clap(long)]
        yes: bool,
    },

    /// Exports settings, enabled records and logs (json) or enabled records (csv).
    Export {
        #[clap(long, default_value = "json")]
        format: ExportFormat,
        /// Write to this file instead of stdout.
        #[clap(long, value_parser = parse_path)]
        file: Option<PathBuf>,
    },

    /// Imports a json export.
    Import {
        #[clap(value_parser = parse_path)]
        file: PathBuf,
        /// Keep current settings and merge logs instead of replacing them.
        #[clap(long)]
        merge: bool,
    },

    /// Checks the installation for problems.
    Diagnostics,

    /// Fixes common problems.
    Repair {
        #[clap(long)]
        reset_settings: bool,
        /// Ask the daemon to register the daily timer again.
        #[clap(long)]
        reschedule_cron: bool,
        /// Remove every per-record flag and counter.
        #[clap(long)]
        clear_meta: bool,
    },

    /// Shows or changes settings.
    Settings {
        #[clap(long)]
        enabled: Option<bool>,
        /// Daily run time, HH:MM server-local.
        #[clap(long)]
        time: Option<ScheduleTime>,
        /// Comma separated.
        #[clap(long, value_delimiter = ',')]
        categories: Option<Vec<String>>,
        #[clap(long)]
        batch_size: Option<u32>,
        #[clap(long)]
        touch_creation: Option<bool>,
        #[clap(long)]
        touch_modification: Option<bool>,
    },

    /// Shows recent runs.
    History {
        #[clap(long, default_value_t = 10)]
        limit: usize,
    },

    /// Removes all refresher data: settings, logs, undo buffer and record meta.
    Purge {
        #[clap(long)]
        yes: bool,
    },
}

fn open_service(location: &StoreLocation) -> Result<RefresherService> {
    let file_config = match &location.config {
        Some(path) => Some(config::FileConfig::load(path)?),
        None => None,
    };
    let cli_config = config::CliConfig {
        db_dir: location.db_dir.clone(),
        records_db: location.records_db.clone(),
        ..Default::default()
    };
    let app_config = config::AppConfig::resolve(&cli_config, file_config)?;

    let state_store = Arc::new(SqliteStateStore::new(app_config.state_db_path())?);
    let record_store = Arc::new(SqliteRecordStore::new(app_config.records_db_path())?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    Ok(RefresherService::new(state_store, record_store, clock))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn print_bulk_result(result: &BulkToggleResult, enabled: bool) {
    let verb = if enabled { "Enabled" } else { "Disabled" };
    if result.updated.is_empty() {
        cli_style::print_warning("No records changed");
    } else {
        cli_style::print_success(&format!(
            "{} {} record(s). Run `undo` within 5 minutes to revert.",
            verb,
            result.updated.len()
        ));
    }
    for id in &result.missing {
        cli_style::print_warning(&format!("Record {} not found", id));
    }
}

fn execute(command: Command, service: &RefresherService) -> Result<ExitCode> {
    match command {
        Command::Status { format } => {
            let status = service.get_status()?;
            if let OutputFormat::Json = format {
                print_json(&status)?;
                return Ok(ExitCode::SUCCESS);
            }
            cli_style::print_section_header("Daily Refresher");
            cli_style::print_key_flag("Enabled", yes_no(status.enabled), status.enabled);
            cli_style::print_key_value("Schedule time", &status.schedule_time);
            cli_style::print_key_flag(
                "Scheduled",
                yes_no(status.scheduler_registered),
                status.scheduler_registered || !status.enabled,
            );
            if let Some(next) = status.next_fire_at {
                cli_style::print_key_value("Next run", &format_local(&next));
            }
            cli_style::print_key_value("Categories", &status.target_categories.join(", "));
            cli_style::print_key_value("Batch size", &status.batch_size.to_string());
            cli_style::print_key_value(
                "Touches",
                match (status.fields.creation, status.fields.modification) {
                    (true, true) => "creation + modification",
                    (false, true) => "modification",
                    _ => "creation",
                },
            );
            cli_style::print_key_value("Eligible records", &status.eligible_records.to_string());
            cli_style::print_key_value("Audit log entries", &status.audit_log_entries.to_string());
            cli_style::print_key_value(
                "Last run",
                &status
                    .last_run_at
                    .map(|at| format_local(&at))
                    .unwrap_or_else(|| "Never".to_string()),
            );
            cli_style::print_key_value(
                "Total updates",
                &status.total_updates_applied.to_string(),
            );
            if status.run_in_progress {
                cli_style::print_key_flag("Run in progress", "yes", false);
            }
            if status.undo_available {
                cli_style::print_key_value("Undo", "available");
            }
            cli_style::print_section_footer();
        }

        Command::List {
            status,
            limit,
            offset,
            format,
        } => {
            let page = service.list_records(&RecordListQuery {
                eligibility: status.into(),
                limit,
                offset,
            })?;
            match format {
                ListFormat::Count => println!("{}", page.total),
                ListFormat::Json => print_json(&page)?,
                ListFormat::Csv => {
                    let mut writer = csv::Writer::from_writer(std::io::stdout());
                    writer.write_record([
                        "RecordID",
                        "Title",
                        "Category",
                        "Created",
                        "Enabled",
                        "LastUpdate",
                        "UpdateCount",
                    ])?;
                    for item in &page.items {
                        writer.write_record([
                            item.id.to_string(),
                            item.title.clone(),
                            item.category.clone(),
                            format_local(&item.created_at),
                            item.eligibility.as_str().to_string(),
                            item.counters.last_auto_update.clone().unwrap_or_default(),
                            item.counters.update_count.to_string(),
                        ])?;
                    }
                    writer.flush()?;
                }
                ListFormat::Table => {
                    if page.items.is_empty() {
                        cli_style::print_empty_list("No records");
                        return Ok(ExitCode::SUCCESS);
                    }
                    let mut table = TableBuilder::new(&[
                        "ID", "Title", "Category", "Created", "Enabled", "Updates",
                    ]);
                    for item in &page.items {
                        table.add_row(vec![
                            item.id.to_string(),
                            item.title.clone(),
                            item.category.clone(),
                            format_local(&item.created_at),
                            item.eligibility.as_str().to_string(),
                            item.counters.update_count.to_string(),
                        ]);
                    }
                    table.print();
                    println!("  {} of {} record(s)", page.items.len(), page.total);
                }
            }
        }

        Command::Enable { ids, all } => {
            let result = if all {
                service.enable_all()?
            } else {
                service.bulk_toggle(&ids, true)?
            };
            print_bulk_result(&result, true);
        }

        Command::Disable { ids, all } => {
            let result = if all {
                service.disable_all()?
            } else {
                service.bulk_toggle(&ids, false)?
            };
            print_bulk_result(&result, false);
        }

        Command::Undo => {
            let outcome = service.revert_last_bulk_action()?;
            cli_style::print_success(&format!(
                "Restored {} record(s)",
                outcome.records_restored
            ));
            if outcome.records_skipped > 0 {
                cli_style::print_warning(&format!(
                    "Skipped {} record(s) that no longer exist or could not be written",
                    outcome.records_skipped
                ));
            }
        }

        Command::Trigger {
            dry_run,
            batch_size,
            respect_enabled,
        } => match service.trigger_run(!respect_enabled, dry_run, batch_size)? {
            TriggerOutcome::DryRun(report) => {
                if report.planned.is_empty() {
                    cli_style::print_warning(&report.message);
                    return Ok(ExitCode::SUCCESS);
                }
                cli_style::print_info(&report.message);
                let mut table = TableBuilder::new(&["ID", "Title", "Current", "New"]);
                for planned in &report.planned {
                    table.add_row(vec![
                        planned.record_id.to_string(),
                        planned.title.clone(),
                        format_local(&planned.old_timestamp),
                        format_local(&planned.new_timestamp),
                    ]);
                }
                table.print();
            }
            TriggerOutcome::Run(result) => match result.outcome {
                RunOutcome::Completed if result.records_failed == 0 => {
                    cli_style::print_success(&result.message)
                }
                RunOutcome::Completed => {
                    cli_style::print_warning(&result.message);
                    for line in &result.detail_log {
                        cli_style::print_list_item(line, colors::MUTED);
                    }
                }
                RunOutcome::AlreadyRunning => {
                    cli_style::print_error("Another run is in progress");
                    return Ok(ExitCode::FAILURE);
                }
                RunOutcome::Disabled | RunOutcome::NoEligibleRecords => {
                    cli_style::print_warning(&format!("Nothing done: {}", result.message))
                }
            },
        },

        Command::Logs {
            limit,
            offset,
            record_id,
            format,
        } => match format {
            LogFormat::Csv => print!("{}", String::from_utf8(service.export_audit_log_csv()?)?),
            LogFormat::Json | LogFormat::Table => {
                let page = service.list_audit_log(&AuditLogQuery {
                    record_id,
                    limit,
                    offset,
                })?;
                if let LogFormat::Json = format {
                    print_json(&page)?;
                } else if page.entries.is_empty() {
                    cli_style::print_empty_list("The audit log is empty");
                } else {
                    let mut table =
                        TableBuilder::new(&["Date", "ID", "Title", "Old", "New"]);
                    for entry in &page.entries {
                        table.add_row(vec![
                            format_local(&entry.applied_at),
                            entry.record_id.to_string(),
                            entry.record_title.clone(),
                            format_local(&entry.old_timestamp),
                            format_local(&entry.new_timestamp),
                        ]);
                    }
                    table.print();
                    println!("  {} of {} entries", page.entries.len(), page.total);
                }
            }
        },

        Command::ClearLogs { yes } => {
            if !yes {
                bail!("Refusing to clear the audit log without --yes");
            }
            let removed = service.clear_audit_log()?;
            cli_style::print_success(&format!("Removed {} audit log entries", removed));
        }

        Command::Export { format, file } => {
            let bytes = service.export(format)?;
            match file {
                Some(path) => {
                    std::fs::write(&path, &bytes)
                        .with_context(|| format!("Failed to write {:?}", path))?;
                    cli_style::print_success(&format!("Exported {} to {:?}", format, path));
                }
                None => print!("{}", String::from_utf8(bytes)?),
            }
        }

        Command::Import { file, merge } => {
            let bytes =
                std::fs::read(&file).with_context(|| format!("Failed to read {:?}", file))?;
            let summary = service.import(&bytes, merge)?;
            cli_style::print_success("Import complete");
            cli_style::print_key_value("Settings imported", yes_no(summary.settings_imported));
            cli_style::print_key_value("Records enabled", &summary.records_enabled.to_string());
            if summary.records_skipped > 0 {
                cli_style::print_warning(&format!(
                    "{} listed record(s) do not exist here",
                    summary.records_skipped
                ));
            }
            if let Some(logs) = summary.logs_imported {
                cli_style::print_key_value("Audit log entries", &logs.to_string());
            }
        }

        Command::Diagnostics => {
            let report = service.diagnostics()?;
            cli_style::print_section_header("Diagnostics");
            cli_style::print_key_value("SQLite", &report.sqlite_version);
            cli_style::print_key_flag(
                "Scheduled",
                yes_no(report.scheduler_registered),
                report.scheduler_registered,
            );
            if let Some(next) = report.next_fire_at {
                cli_style::print_key_value("Next run", &format_local(&next));
            }
            cli_style::print_key_value("Eligible records", &report.eligible_records.to_string());
            cli_style::print_section_footer();

            for issue in &report.issues {
                cli_style::print_error(issue);
            }
            for warning in &report.warnings {
                cli_style::print_warning(warning);
            }
            if !report.is_healthy() {
                return Ok(ExitCode::FAILURE);
            }
            if report.warnings.is_empty() {
                cli_style::print_success("No problems found");
            }
        }

        Command::Repair {
            reset_settings,
            reschedule_cron,
            clear_meta,
        } => {
            let options = RepairOptions {
                reset_settings,
                reschedule: reschedule_cron,
                clear_meta,
            };
            if options.is_empty() {
                bail!("Nothing to repair, pass --reset-settings, --reschedule-cron or --clear-meta");
            }
            let report = service.repair(options)?;
            if report.settings_reset {
                cli_style::print_success("Settings reset to defaults");
            }
            match report.reschedule {
                Some(RescheduleOutcome::Requested) => cli_style::print_success(
                    "Schedule cleared, the daemon registers it again on its next sync",
                ),
                Some(RescheduleOutcome::Registered { next_fire_at }) => {
                    cli_style::print_success(&match next_fire_at {
                        Some(at) => format!("Rescheduled, next run at {}", format_local(&at)),
                        None => "Schedule cleared, refreshing is disabled".to_string(),
                    })
                }
                None => {}
            }
            if let Some(removed) = report.meta_rows_cleared {
                cli_style::print_success(&format!("Removed {} meta value(s)", removed));
            }
        }

        Command::Settings {
            enabled,
            time,
            categories,
            batch_size,
            touch_creation,
            touch_modification,
        } => {
            let patch = SettingsPatch {
                enabled,
                schedule_time: time,
                target_categories: categories,
                touch_creation_timestamp: touch_creation,
                touch_modification_timestamp: touch_modification,
                batch_size,
            };
            let settings = if patch == SettingsPatch::default() {
                service.get_settings()?
            } else {
                let saved = service.save_settings(patch)?;
                cli_style::print_success("Settings saved");
                saved
            };
            print_json(&settings)?;
        }

        Command::History { limit } => {
            let runs = service.run_history(limit)?;
            if runs.is_empty() {
                cli_style::print_empty_list("No runs yet");
                return Ok(ExitCode::SUCCESS);
            }
            let mut table = TableBuilder::new(&[
                "ID", "Started", "Status", "Trigger", "Updated", "Failed", "Message",
            ]);
            for run in &runs {
                table.add_row(vec![
                    run.id.to_string(),
                    run.started_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
                    run.status.as_str().to_string(),
                    run.triggered_by.as_str().to_string(),
                    run.records_updated.to_string(),
                    run.records_failed.to_string(),
                    run.message.clone().unwrap_or_default(),
                ]);
            }
            table.print();
        }

        Command::Purge { yes } => {
            if !yes {
                bail!("Refusing to remove all refresher data without --yes");
            }
            let report = service.teardown()?;
            cli_style::print_success(&format!(
                "Removed {} audit log entries and {} meta value(s)",
                report.audit_entries_cleared, report.meta_rows_cleared
            ));
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    let cli_args = CliArgs::parse();

    // Logs go to stderr so csv/json output stays clean.
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::WARN.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init();

    let result = open_service(&cli_args.location)
        .and_then(|service| execute(cli_args.command, &service));
    match result {
        Ok(code) => code,
        Err(e) => {
            cli_style::print_error(&format!("{:#}", e));
            ExitCode::FAILURE
        }
    }
}
