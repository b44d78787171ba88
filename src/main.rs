use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use daily_refresher::clock::{Clock, SystemClock};
use daily_refresher::config;
use daily_refresher::metrics;
use daily_refresher::record_store::SqliteRecordStore;
use daily_refresher::scheduler::{RefreshScheduler, TokioTimerRegistrar};
use daily_refresher::service::RefresherService;
use daily_refresher::state_store::SqliteStateStore;

fn parse_path(s: &str) -> Result<PathBuf, String> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(format!("Error resolving path '{}': {}", s, msg));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir().map_err(|e| format!("Failed to get current dir: {}", e))?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to TOML configuration file. Values in the file override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Directory holding the refresher's state database (state.db).
    /// Can also be specified in config file.
    #[clap(long, value_parser = parse_path)]
    pub db_dir: Option<PathBuf>,

    /// Record store database. Relative paths are resolved against db_dir.
    #[clap(long)]
    pub records_db: Option<PathBuf>,

    /// The port for the metrics server (Prometheus scraping). 0 disables it.
    #[clap(long, default_value_t = 9092)]
    pub metrics_port: u16,

    /// Default log level when LOG_LEVEL is not set.
    #[clap(long)]
    pub log_level: Option<String>,

    /// Seconds between checks that the daily timer matches stored settings.
    #[clap(long)]
    pub sync_interval_secs: Option<u64>,
}

/// Convert CLI args to CliConfig for config resolution
impl From<&CliArgs> for config::CliConfig {
    fn from(args: &CliArgs) -> Self {
        config::CliConfig {
            db_dir: args.db_dir.clone(),
            records_db: args.records_db.clone(),
            metrics_port: args.metrics_port,
            log_level: args.log_level.clone(),
            sync_interval_secs: args.sync_interval_secs,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    // The log level may come from the config file, so resolve it first.
    let file_config = match &cli_args.config {
        Some(path) => Some(config::FileConfig::load(path)?),
        None => None,
    };
    let cli_config: config::CliConfig = (&cli_args).into();
    let app_config = config::AppConfig::resolve(&cli_config, file_config)?;

    let default_level: LevelFilter = app_config
        .log_level
        .parse()
        .with_context(|| format!("Invalid log level '{}'", app_config.log_level))?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(default_level.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to install log subscriber")?;

    info!("Configuration loaded:");
    info!("  db_dir: {:?}", app_config.db_dir);
    info!("  records_db: {:?}", app_config.records_db_path());
    info!("  sync_interval: {}s", app_config.sync_interval.as_secs());

    info!(
        "Opening state database at {:?}...",
        app_config.state_db_path()
    );
    let state_store = Arc::new(SqliteStateStore::new(app_config.state_db_path())?);
    info!(
        "Opening record database at {:?}...",
        app_config.records_db_path()
    );
    let record_store = Arc::new(SqliteRecordStore::new(app_config.records_db_path())?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    info!("Initializing metrics...");
    metrics::init_metrics();

    let shutdown_token = CancellationToken::new();
    let registrar = Arc::new(TokioTimerRegistrar::new(
        tokio::runtime::Handle::current(),
        clock.clone(),
        shutdown_token.child_token(),
    ));
    let service = RefresherService::new(state_store.clone(), record_store.clone(), clock.clone());
    let interrupted = service.engine().fail_interrupted_runs()?;
    if interrupted > 0 {
        warn!("Marked {} interrupted run(s) as failed", interrupted);
    }
    let scheduler = Arc::new(RefreshScheduler::new(
        registrar,
        service.engine(),
        state_store.clone(),
        clock.clone(),
    ));
    let service = service.with_scheduler(scheduler.clone());

    scheduler.sync()?;
    let report = service.diagnostics()?;
    for issue in &report.issues {
        error!("Diagnostics: {}", issue);
    }
    for warning in &report.warnings {
        warn!("Diagnostics: {}", warning);
    }
    match report.next_fire_at {
        Some(at) => info!("Next refresh at {}", at),
        None => info!("No refresh scheduled"),
    }

    let metrics_task = if app_config.metrics_port > 0 {
        Some(tokio::spawn(metrics::run_metrics_server(
            app_config.metrics_port,
            shutdown_token.clone(),
        )))
    } else {
        info!("Metrics server disabled");
        None
    };
    let scheduler_task = tokio::spawn(
        scheduler
            .clone()
            .run(app_config.sync_interval, shutdown_token.clone()),
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C, initiating graceful shutdown");
    shutdown_token.cancel();

    if let Err(e) = scheduler_task.await {
        error!("Scheduler task failed: {}", e);
    }
    if let Some(task) = metrics_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Metrics server failed: {}", e),
            Err(e) => error!("Metrics server task failed: {}", e),
        }
    }
    info!("Shutdown complete");
    Ok(())
}
