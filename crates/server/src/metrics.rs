//! Prometheus metrics for the Quire gateway.
//!
//! Exposes counters for the upload pipeline and task orchestration plus
//! latency histograms for chunk writes and assembly.
//!
//! The `/metrics` endpoint is unauthenticated. It carries aggregate counts
//! only, no upload or task identifiers.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    self, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Upload session metrics
pub static UPLOAD_SESSIONS_CREATED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "quire_upload_sessions_created_total",
        "Total number of upload sessions created",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_SESSIONS_COMPLETED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "quire_upload_sessions_completed_total",
        "Total number of upload sessions assembled into an artifact",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_SESSIONS_FAILED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "quire_upload_sessions_failed_total",
        "Total number of upload sessions that failed assembly or validation",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_SESSIONS_EXPIRED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "quire_upload_sessions_expired_total",
        "Total number of upload sessions expired by idleness or aborted",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_SESSIONS_REAPED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "quire_upload_sessions_reaped_total",
        "Total finished upload sessions removed after retention",
    )
    .expect("metric creation failed")
});

// Chunk metrics
pub static CHUNKS_RECEIVED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("quire_chunks_received_total", "Total number of chunks stored")
        .expect("metric creation failed")
});

pub static BYTES_RECEIVED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "quire_bytes_received_total",
        "Total chunk bytes stored",
    )
    .expect("metric creation failed")
});

pub static DUPLICATE_CHUNKS_REJECTED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "quire_duplicate_chunks_rejected_total",
        "Total number of chunk writes rejected as duplicates",
    )
    .expect("metric creation failed")
});

// Timing metrics
pub static CHUNK_WRITE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "quire_chunk_write_duration_seconds",
            "Time taken to receive and store a single chunk",
        )
        .buckets(vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
    )
    .expect("metric creation failed")
});

pub static ASSEMBLY_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "quire_assembly_duration_seconds",
            "Time taken to assemble and validate an upload",
        )
        .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
    )
    .expect("metric creation failed")
});

// Error metrics
pub static UPLOAD_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("quire_upload_errors_total", "Total upload errors by error code"),
        &["error_type"],
    )
    .expect("metric creation failed")
});

// Task metrics
pub static TASKS_STARTED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("quire_tasks_started_total", "Total tasks started by kind"),
        &["kind"],
    )
    .expect("metric creation failed")
});

pub static TASKS_FINISHED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "quire_tasks_finished_total",
            "Total tasks that reached a terminal stage, by outcome",
        ),
        &["outcome"],
    )
    .expect("metric creation failed")
});

pub static TASKS_CANCELLED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "quire_tasks_cancelled_total",
        "Total cancellation requests accepted",
    )
    .expect("metric creation failed")
});

pub static TASKS_REAPED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "quire_tasks_reaped_total",
        "Total terminal tasks removed after retention",
    )
    .expect("metric creation failed")
});

// Current state gauges
pub static ACTIVE_EVENT_STREAMS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "quire_active_event_streams",
        "Current number of open task event streams",
    )
    .expect("metric creation failed")
});

static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Safe to call more than once; only the first call registers.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(UPLOAD_SESSIONS_CREATED.clone()),
            Box::new(UPLOAD_SESSIONS_COMPLETED.clone()),
            Box::new(UPLOAD_SESSIONS_FAILED.clone()),
            Box::new(UPLOAD_SESSIONS_EXPIRED.clone()),
            Box::new(UPLOAD_SESSIONS_REAPED.clone()),
            Box::new(CHUNKS_RECEIVED.clone()),
            Box::new(BYTES_RECEIVED.clone()),
            Box::new(DUPLICATE_CHUNKS_REJECTED.clone()),
            Box::new(CHUNK_WRITE_DURATION.clone()),
            Box::new(ASSEMBLY_DURATION.clone()),
            Box::new(UPLOAD_ERRORS.clone()),
            Box::new(TASKS_STARTED.clone()),
            Box::new(TASKS_FINISHED.clone()),
            Box::new(TASKS_CANCELLED.clone()),
            Box::new(TASKS_REAPED.clone()),
            Box::new(ACTIVE_EVENT_STREAMS.clone()),
        ];
        for collector in collectors {
            REGISTRY
                .register(collector)
                .expect("metric registration failed");
        }
    });
}

/// Handler for GET /metrics.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        ),
    }
}

/// Helper to record upload errors by code.
pub fn record_upload_error(error_type: &str) {
    UPLOAD_ERRORS.with_label_values(&[error_type]).inc();
}
