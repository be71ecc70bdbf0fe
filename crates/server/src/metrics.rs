//! Prometheus metrics for the Depot server.
//!
//! Exposes metrics for the upload pipeline and cleanup jobs.
//!
//! # Security Note
//!
//! The `/metrics` endpoint is unauthenticated to allow Prometheus scraping.
//! It exposes aggregate system usage only, but MUST still be
//! network-restricted to authorized scraper IPs at the infrastructure level.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use depot_core::batch::MetricsSink;
use prometheus::{
    self, Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder,
};
use std::sync::{LazyLock, Once};
use std::time::Duration;

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Upload pipeline metrics
pub static UPLOADS_STARTED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_uploads_started_total",
        "Total number of file uploads started",
    )
    .expect("metric creation failed")
});

pub static UPLOADS_SUCCEEDED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_uploads_succeeded_total",
        "Total number of file uploads that succeeded",
    )
    .expect("metric creation failed")
});

pub static UPLOADS_FAILED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_uploads_failed_total",
        "Total number of file uploads that permanently failed",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_RETRIES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_upload_retries_total",
        "Total number of upload attempt retries",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_BYTES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("depot_upload_bytes_total", "Total bytes uploaded")
        .expect("metric creation failed")
});

pub static UPLOAD_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "depot_upload_duration_seconds",
            "Time taken to upload a single file, including retries",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 120.0]),
    )
    .expect("metric creation failed")
});

// Cleanup metrics
pub static CLEANUP_JOBS_ACTIVE: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "depot_cleanup_jobs_active",
        "Number of cleanup jobs currently running",
    )
    .expect("metric creation failed")
});

pub static CLEANUP_JOBS_PANICKED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_cleanup_jobs_panicked_total",
        "Total number of cleanup job tasks that panicked",
    )
    .expect("metric creation failed")
});

pub static ORPHANS_FOUND: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_orphans_found_total",
        "Total number of orphan candidates surfaced by scans",
    )
    .expect("metric creation failed")
});

pub static FILES_DELETED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_files_deleted_total",
        "Total number of storage objects deleted by cleanup jobs",
    )
    .expect("metric creation failed")
});

pub static BYTES_RECLAIMED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_bytes_reclaimed_total",
        "Total storage bytes reclaimed by cleanup jobs",
    )
    .expect("metric creation failed")
});

pub static SCAN_PAGES_FETCHED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_scan_pages_fetched_total",
        "Total listing pages fetched by orphan scans",
    )
    .expect("metric creation failed")
});

static REGISTER: Once = Once::new();

/// Register all metrics with the global registry. Idempotent.
pub fn register_metrics() {
    REGISTER.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(UPLOADS_STARTED.clone()),
            Box::new(UPLOADS_SUCCEEDED.clone()),
            Box::new(UPLOADS_FAILED.clone()),
            Box::new(UPLOAD_RETRIES.clone()),
            Box::new(UPLOAD_BYTES.clone()),
            Box::new(UPLOAD_DURATION.clone()),
            Box::new(CLEANUP_JOBS_ACTIVE.clone()),
            Box::new(CLEANUP_JOBS_PANICKED.clone()),
            Box::new(ORPHANS_FOUND.clone()),
            Box::new(FILES_DELETED.clone()),
            Box::new(BYTES_RECLAIMED.clone()),
            Box::new(SCAN_PAGES_FETCHED.clone()),
        ];
        for collector in collectors {
            REGISTRY
                .register(collector)
                .expect("metric registration failed");
        }
    });
}

/// GET /metrics - Prometheus text exposition.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, String::new()).into_response();
    }
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}

/// Metrics sink feeding the upload pipeline's events into Prometheus.
pub struct PrometheusSink;

impl MetricsSink for PrometheusSink {
    fn upload_started(&self, _name: &str) {
        UPLOADS_STARTED.inc();
    }

    fn upload_retried(&self, _name: &str, _attempt: u32) {
        UPLOAD_RETRIES.inc();
    }

    fn upload_succeeded(&self, _name: &str, duration: Duration) {
        UPLOADS_SUCCEEDED.inc();
        UPLOAD_DURATION.observe(duration.as_secs_f64());
    }

    fn upload_failed(&self, _name: &str, _retryable: bool) {
        UPLOADS_FAILED.inc();
    }
}
