use crate::jobs::{JobQueue, JobStatus, StatusCounts};
use axum::{extract::State, http::StatusCode, response::IntoResponse};
use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;

/// Metric name prefix for all job metrics
const PREFIX: &str = "pezzottify_jobs";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Execution
    pub static ref JOBS_EXECUTED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_executed_total"), "Total job executions by outcome"),
        &["job_type", "outcome"]
    ).expect("Failed to create executed_total metric");

    pub static ref JOB_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_duration_seconds"),
            "Job handler duration in seconds"
        )
        .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 60.0, 300.0, 1800.0]),
        &["job_type"]
    ).expect("Failed to create duration_seconds metric");

    pub static ref JOBS_ACTIVE: Gauge = Gauge::new(
        format!("{PREFIX}_active"),
        "Number of jobs currently executing"
    ).expect("Failed to create active metric");

    // Queue
    pub static ref JOBS_QUEUE_DEPTH: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_queue_depth"), "Number of jobs by status"),
        &["status"]
    ).expect("Failed to create queue_depth metric");

    // Scheduler
    pub static ref SCHEDULE_FIRES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_schedule_fires_total"), "Total cron schedule fires"),
        &["schedule", "outcome"]
    ).expect("Failed to create schedule_fires_total metric");
}

/// Register all metrics with the registry. Safe to call more than once.
pub fn init_metrics() {
    let _ = REGISTRY.register(Box::new(JOBS_EXECUTED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOB_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_ACTIVE.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_QUEUE_DEPTH.clone()));
    let _ = REGISTRY.register(Box::new(SCHEDULE_FIRES_TOTAL.clone()));

    tracing::info!("Metrics system initialized successfully");
}

/// Record a finished job execution. `outcome` is completed, retry or failed.
pub fn record_job_execution(job_type: &str, outcome: &str, duration: Duration) {
    JOBS_EXECUTED_TOTAL
        .with_label_values(&[job_type, outcome])
        .inc();

    JOB_DURATION_SECONDS
        .with_label_values(&[job_type])
        .observe(duration.as_secs_f64());
}

pub fn set_active_jobs(count: usize) {
    JOBS_ACTIVE.set(count as f64);
}

pub fn record_schedule_fire(schedule: &str, outcome: &str) {
    SCHEDULE_FIRES_TOTAL
        .with_label_values(&[schedule, outcome])
        .inc();
}

pub fn update_queue_depth(counts: &StatusCounts) {
    for status in JobStatus::ALL {
        JOBS_QUEUE_DEPTH
            .with_label_values(&[status.as_str()])
            .set(counts.get(status) as f64);
    }
}

/// Handler for the /metrics endpoint
pub async fn metrics_handler(State(queue): State<Arc<dyn JobQueue>>) -> impl IntoResponse {
    match queue.get_status_counts() {
        Ok(counts) => update_queue_depth(&counts),
        Err(e) => tracing::warn!("Failed to refresh queue depth: {}", e),
    }

    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_default();
            (StatusCode::OK, response)
        }
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}
