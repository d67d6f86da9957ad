//! Prometheus metrics for the Cask server.
//!
//! The `/metrics` endpoint is unauthenticated and only mounted when
//! `server.metrics_enabled` is set. Labels never carry workspace ids or keys.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{self, Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Proxy upload metrics
pub static PROXY_UPLOADS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "cask_proxy_uploads_total",
            "Proxy upload requests by route and result",
        ),
        &["route", "result"],
    )
    .expect("metric creation failed")
});

pub static PROXY_BYTES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "cask_proxy_bytes_total",
        "Bytes accepted by the proxy upload endpoints",
    )
    .expect("metric creation failed")
});

// Completion metrics
pub static COMPLETIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "cask_blob_completions_total",
            "Blob completion checks by outcome",
        ),
        &["outcome"],
    )
    .expect("metric creation failed")
});

// Reaper metrics
pub static REAPER_RUNS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("cask_reaper_runs_total", "Total number of upload reaper runs")
        .expect("metric creation failed")
});

pub static REAPER_ABORTED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "cask_reaper_aborted_total",
        "Multipart uploads aborted by the reaper",
    )
    .expect("metric creation failed")
});

pub static REAPER_DELETED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "cask_reaper_deleted_total",
        "Abandoned pending blobs deleted by the reaper",
    )
    .expect("metric creation failed")
});

pub static REAPER_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "cask_reaper_errors_total",
        "Per-item failures during reaper runs",
    )
    .expect("metric creation failed")
});

static REGISTER: Once = Once::new();

/// Register all metrics with the global registry. Safe to call repeatedly.
pub fn register_metrics() {
    REGISTER.call_once(|| {
        REGISTRY
            .register(Box::new(PROXY_UPLOADS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(PROXY_BYTES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(COMPLETIONS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(REAPER_RUNS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(REAPER_ABORTED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(REAPER_DELETED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(REAPER_ERRORS.clone()))
            .expect("metric registration failed");
    });
}

/// GET /metrics - Prometheus metrics endpoint.
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

/// Record one proxy upload outcome.
pub fn record_proxy_upload(route: &str, result: &str) {
    PROXY_UPLOADS.with_label_values(&[route, result]).inc();
}

/// Record one completion outcome.
pub fn record_completion(outcome: &str) {
    COMPLETIONS.with_label_values(&[outcome]).inc();
}
