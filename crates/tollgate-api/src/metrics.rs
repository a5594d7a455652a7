//! Metrics middleware and instrumentation for the Tollgate API.
//!
//! Provides Prometheus metrics for:
//! - Request duration and throughput
//! - Idempotency gate decisions
//! - Protected operation outcomes
//! - State store size

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use axum::extract::{MatchedPath, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::server::AppState;

// ============================================================================
// Metric Names
// ============================================================================

/// API request duration histogram.
pub const API_REQUEST_DURATION: &str = "api_request_duration_seconds";

/// API request counter.
pub const API_REQUEST_TOTAL: &str = "api_request_total";

/// Gate decision counter, labelled by outcome.
pub const IDEMPOTENCY_GATE_DECISIONS: &str = "idempotency_gate_decisions_total";

/// Protected operation counter, labelled by result.
pub const IDEMPOTENCY_EXECUTIONS: &str = "idempotency_executions_total";

/// Approximate number of live records in the state store.
pub const IDEMPOTENCY_STORE_ENTRIES: &str = "idempotency_store_entries";

const UNMATCHED_ENDPOINT: &str = "unmatched";

// ============================================================================
// Prometheus Recorder
// ============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initializes the global metrics recorder with Prometheus exporter.
///
/// Safe to call multiple times; subsequent calls are no-ops.
///
/// # Panics
///
/// Panics if the Prometheus recorder cannot be installed. The server should
/// not start without its metrics recorder.
#[allow(clippy::panic)]
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .unwrap_or_else(|e| panic!("failed to install prometheus recorder: {e}"));

            describe_histogram!(API_REQUEST_DURATION, "Duration of API requests in seconds");
            describe_counter!(API_REQUEST_TOTAL, "Total number of API requests");
            describe_counter!(
                IDEMPOTENCY_GATE_DECISIONS,
                "Idempotency gate decisions by outcome"
            );
            describe_counter!(
                IDEMPOTENCY_EXECUTIONS,
                "Protected operations executed under an idempotency key, by result"
            );
            describe_gauge!(
                IDEMPOTENCY_STORE_ENTRIES,
                "Approximate number of live idempotency records"
            );

            tracing::info!("Prometheus metrics recorder initialized");
            handle
        })
        .clone()
}

/// Returns the global Prometheus handle, if initialized.
#[must_use]
pub fn prometheus_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// ============================================================================
// Metrics Middleware
// ============================================================================

pub(crate) fn endpoint_label<B>(request: &Request<B>) -> String {
    request.extensions().get::<MatchedPath>().map_or_else(
        || UNMATCHED_ENDPOINT.to_string(),
        |path| path.as_str().to_string(),
    )
}

/// Middleware that records request metrics.
///
/// Captures:
/// - `api_request_duration_seconds{endpoint, method, status_class}`
/// - `api_request_total{endpoint, method, status_class}`
pub async fn metrics_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let path = endpoint_label(&request);
    let method = request.method().to_string();

    let response = next.run(request).await;

    let duration = start.elapsed().as_secs_f64();
    let status_class = status_class(response.status());

    let labels = [
        ("endpoint", path.clone()),
        ("method", method.clone()),
        ("status_class", status_class.to_string()),
    ];

    histogram!(API_REQUEST_DURATION, &labels).record(duration);
    counter!(API_REQUEST_TOTAL, &labels).increment(1);

    // Uploads can legitimately be slow; only flag the extreme cases.
    if duration > 5.0 {
        tracing::warn!(
            endpoint = %path,
            method = %method,
            status = response.status().as_u16(),
            duration_secs = %duration,
            "Slow request detected"
        );
    }

    response
}

/// Returns the status class (2xx, 3xx, 4xx, 5xx) for a status code.
fn status_class(status: StatusCode) -> &'static str {
    match status.as_u16() {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "unknown",
    }
}

// ============================================================================
// Metrics Endpoint
// ============================================================================

/// Handler for the `/metrics` endpoint.
///
/// Refreshes the store size gauge, then returns Prometheus-formatted metrics
/// text.
pub async fn serve_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.gate.store().stats().await {
        Ok(stats) => record_store_entries(stats.entries),
        Err(error) => tracing::warn!(error = %error, "Failed to read idempotency store size"),
    }

    prometheus_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain; charset=utf-8")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Records a gate decision (`pass_through`, `admitted`, `conflict`, ...).
pub fn record_gate_decision(outcome: &'static str) {
    counter!(IDEMPOTENCY_GATE_DECISIONS, "outcome" => outcome).increment(1);
}

/// Records the result of a protected operation (`completed` or `failed`).
pub fn record_execution(result: &'static str) {
    counter!(IDEMPOTENCY_EXECUTIONS, "result" => result).increment(1);
}

/// Records the current store size.
#[allow(clippy::cast_precision_loss)]
pub fn record_store_entries(entries: u64) {
    gauge!(IDEMPOTENCY_STORE_ENTRIES).set(entries as f64);
}

// ============================================================================
// Tests
// ============================================================================
