use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, Gauge, Histogram, HistogramOpts, IntCounter, Opts, Registry, TextEncoder,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Metric name prefix for all refresher metrics
const PREFIX: &str = "daily_refresher";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref RUNS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_runs_total"), "Refresh runs by trigger and outcome"),
        &["trigger", "outcome"]
    ).expect("Failed to create runs_total metric");

    pub static ref RUN_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            format!("{PREFIX}_run_duration_seconds"),
            "Duration of refresh runs that processed a batch"
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0])
    ).expect("Failed to create run_duration_seconds metric");

    pub static ref RECORDS_UPDATED_TOTAL: IntCounter = IntCounter::new(
        format!("{PREFIX}_records_updated_total"),
        "Records whose timestamps were rewritten"
    ).expect("Failed to create records_updated_total metric");

    pub static ref RECORDS_FAILED_TOTAL: IntCounter = IntCounter::new(
        format!("{PREFIX}_records_failed_total"),
        "Records a run could not update"
    ).expect("Failed to create records_failed_total metric");

    pub static ref RUN_IN_PROGRESS: Gauge = Gauge::new(
        format!("{PREFIX}_run_in_progress"),
        "1 while this process holds the run lock"
    ).expect("Failed to create run_in_progress metric");

    pub static ref NEXT_FIRE_TIMESTAMP_SECONDS: Gauge = Gauge::new(
        format!("{PREFIX}_next_fire_timestamp_seconds"),
        "Unix time of the next scheduled run, 0 when not scheduled"
    ).expect("Failed to create next_fire_timestamp_seconds metric");
}

pub fn init_metrics() {
    // Ignore errors if already registered (tests)
    let _ = REGISTRY.register(Box::new(RUNS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(RUN_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(RECORDS_UPDATED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(RECORDS_FAILED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(RUN_IN_PROGRESS.clone()));
    let _ = REGISTRY.register(Box::new(NEXT_FIRE_TIMESTAMP_SECONDS.clone()));

    info!("Metrics system initialized");
}

pub fn record_run(trigger: &str, outcome: &str) {
    RUNS_TOTAL.with_label_values(&[trigger, outcome]).inc();
}

pub fn record_batch(updated: usize, failed: usize, duration: Duration) {
    RECORDS_UPDATED_TOTAL.inc_by(updated as u64);
    RECORDS_FAILED_TOTAL.inc_by(failed as u64);
    RUN_DURATION_SECONDS.observe(duration.as_secs_f64());
}

pub fn set_run_in_progress(in_progress: bool) {
    RUN_IN_PROGRESS.set(if in_progress { 1.0 } else { 0.0 });
}

pub fn set_next_fire_timestamp(unix_seconds: Option<i64>) {
    NEXT_FIRE_TIMESTAMP_SECONDS.set(unix_seconds.unwrap_or(0) as f64);
}

pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_default();
            (StatusCode::OK, response)
        }
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}

/// Serves `/metrics` on 127.0.0.1 until `shutdown` is cancelled.
pub async fn run_metrics_server(port: u16, shutdown: CancellationToken) -> anyhow::Result<()> {
    let app = Router::new().route("/metrics", get(metrics_handler));
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    info!("Metrics available on http://127.0.0.1:{}/metrics", port);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
