//! Observability metrics for request orchestration.
//!
//! Metrics go through the `metrics` crate facade; the server installs a
//! Prometheus recorder and serves `/metrics`.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `sluice_submissions_total` | Counter | `result` | Submissions by outcome |
//! | `sluice_request_transitions_total` | Counter | `from_state`, `to_state` | Request status transitions |
//! | `sluice_file_completions_total` | Counter | `result` | Worker file reports by outcome |
//! | `sluice_ignored_callbacks_total` | Counter | `reason` | File reports dropped (terminal, surplus) |
//! | `sluice_lookup_dispatches_total` | Counter | `result` | Resolver dispatches |
//! | `sluice_files_published_total` | Counter | - | Work items published |
//! | `sluice_fleet_teardown_total` | Counter | `resource`, `result` | Per-resource teardown outcomes |
//! | `sluice_fleet_starts_total` | Counter | `result` | Fleet launches |
//! | `sluice_infra_retries_total` | Counter | `operation` | Broker/cluster/storage retries |
//! | `sluice_callback_duration_seconds` | Histogram | `handler` | Callback handling latency |

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use axum::response::IntoResponse;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::error::{Error, Result};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Submissions by outcome.
    pub const SUBMISSIONS_TOTAL: &str = "sluice_submissions_total";
    /// Counter: Request status transitions.
    pub const REQUEST_TRANSITIONS_TOTAL: &str = "sluice_request_transitions_total";
    /// Counter: File completion reports applied.
    pub const FILE_COMPLETIONS_TOTAL: &str = "sluice_file_completions_total";
    /// Counter: File completion reports ignored.
    pub const IGNORED_CALLBACKS_TOTAL: &str = "sluice_ignored_callbacks_total";
    /// Counter: Resolver lookup dispatches.
    pub const LOOKUP_DISPATCHES_TOTAL: &str = "sluice_lookup_dispatches_total";
    /// Counter: Work items published to request queues.
    pub const FILES_PUBLISHED_TOTAL: &str = "sluice_files_published_total";
    /// Counter: Fleet teardown outcomes per resource.
    pub const FLEET_TEARDOWN_TOTAL: &str = "sluice_fleet_teardown_total";
    /// Counter: Fleet launches.
    pub const FLEET_STARTS_TOTAL: &str = "sluice_fleet_starts_total";
    /// Counter: Infrastructure retries.
    pub const INFRA_RETRIES_TOTAL: &str = "sluice_infra_retries_total";
    /// Histogram: Callback handling latency in seconds.
    pub const CALLBACK_DURATION_SECONDS: &str = "sluice_callback_duration_seconds";
}

/// Label keys used across metrics.
pub mod labels {
    /// Outcome (success, failure, rejected, ...).
    pub const RESULT: &str = "result";
    /// Previous request status.
    pub const FROM_STATE: &str = "from_state";
    /// Target request status.
    pub const TO_STATE: &str = "to_state";
    /// Why a callback was ignored.
    pub const REASON: &str = "reason";
    /// Cluster or broker resource kind.
    pub const RESOURCE: &str = "resource";
    /// Infrastructure operation name.
    pub const OPERATION: &str = "operation";
    /// Callback handler name.
    pub const HANDLER: &str = "handler";
}

/// High-level interface for recording orchestration metrics.
///
/// Cheap to clone and share across tasks.
#[derive(Debug, Clone, Default)]
pub struct FlowMetrics {
    _private: (),
}

impl FlowMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a submission outcome.
    pub fn record_submission(&self, result: &str) {
        counter!(names::SUBMISSIONS_TOTAL, labels::RESULT => result.to_string()).increment(1);
    }

    /// Records a request status transition.
    pub fn record_transition(&self, from_state: &str, to_state: &str) {
        counter!(
            names::REQUEST_TRANSITIONS_TOTAL,
            labels::FROM_STATE => from_state.to_string(),
            labels::TO_STATE => to_state.to_string(),
        )
        .increment(1);
    }

    /// Records an applied file report.
    pub fn record_file_completion(&self, result: &str) {
        counter!(names::FILE_COMPLETIONS_TOTAL, labels::RESULT => result.to_string())
            .increment(1);
    }

    /// Records a dropped file report.
    pub fn record_ignored_callback(&self, reason: &str) {
        counter!(names::IGNORED_CALLBACKS_TOTAL, labels::REASON => reason.to_string())
            .increment(1);
    }

    /// Records a resolver dispatch.
    pub fn record_lookup_dispatch(&self, result: &str) {
        counter!(names::LOOKUP_DISPATCHES_TOTAL, labels::RESULT => result.to_string())
            .increment(1);
    }

    /// Records published work items.
    pub fn record_files_published(&self, count: usize) {
        counter!(names::FILES_PUBLISHED_TOTAL).increment(u64::try_from(count).unwrap_or(u64::MAX));
    }

    /// Records one teardown deletion.
    pub fn record_teardown(&self, resource: &str, result: &str) {
        counter!(
            names::FLEET_TEARDOWN_TOTAL,
            labels::RESOURCE => resource.to_string(),
            labels::RESULT => result.to_string(),
        )
        .increment(1);
    }

    /// Records a fleet launch.
    pub fn record_fleet_start(&self, result: &str) {
        counter!(names::FLEET_STARTS_TOTAL, labels::RESULT => result.to_string()).increment(1);
    }

    /// Records an infrastructure retry.
    pub fn record_retry(&self, operation: &str) {
        counter!(names::INFRA_RETRIES_TOTAL, labels::OPERATION => operation.to_string())
            .increment(1);
    }

    /// Records callback handling latency.
    pub fn observe_callback_duration(&self, handler: &str, duration: Duration) {
        histogram!(
            names::CALLBACK_DURATION_SECONDS,
            labels::HANDLER => handler.to_string(),
        )
        .record(duration.as_secs_f64());
    }
}

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the global Prometheus recorder.
///
/// Safe to call more than once; later calls return the installed handle.
///
/// # Errors
///
/// Returns a configuration error if another recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| Error::configuration(format!("failed to install prometheus recorder: {e}")))?;

    describe_counter!(names::SUBMISSIONS_TOTAL, "Submissions by outcome");
    describe_counter!(
        names::REQUEST_TRANSITIONS_TOTAL,
        "Request status transitions"
    );
    describe_counter!(names::FILE_COMPLETIONS_TOTAL, "Worker file reports applied");
    describe_counter!(names::IGNORED_CALLBACKS_TOTAL, "Worker file reports ignored");
    describe_counter!(names::LOOKUP_DISPATCHES_TOTAL, "Resolver lookup dispatches");
    describe_counter!(names::FILES_PUBLISHED_TOTAL, "Work items published");
    describe_counter!(names::FLEET_TEARDOWN_TOTAL, "Fleet teardown outcomes");
    describe_counter!(names::FLEET_STARTS_TOTAL, "Fleet launches");
    describe_counter!(names::INFRA_RETRIES_TOTAL, "Infrastructure retries");
    describe_histogram!(
        names::CALLBACK_DURATION_SECONDS,
        "Callback handling latency in seconds"
    );

    tracing::info!("prometheus metrics recorder initialized");
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Handler for the `/metrics` endpoint.
pub async fn serve_metrics() -> impl IntoResponse {
    let content_type = [("content-type", "text/plain; charset=utf-8")];
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (StatusCode::OK, content_type, handle.render()),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            content_type,
            "metrics not initialized".to_string(),
        ),
    }
}

/// RAII guard for timing operations.
///
/// Automatically records duration when dropped.
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Creates a new timing guard that will call `on_drop` with the elapsed duration.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Returns the elapsed time since the guard was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}

/// Creates a timing guard that records callback latency for `handler`.
#[must_use]
pub fn time_callback(
    metrics: &FlowMetrics,
    handler: &'static str,
) -> TimingGuard<impl FnOnce(Duration)> {
    let metrics = metrics.clone();
    TimingGuard::new(move |duration| metrics.observe_callback_duration(handler, duration))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_a_noop() {
        let metrics = FlowMetrics::new();
        metrics.record_submission("accepted");
        metrics.record_transition("running", "complete");
        metrics.record_file_completion("success");
        metrics.record_teardown("deployment", "deleted");
        metrics.record_files_published(3);
        metrics.observe_callback_duration("file_complete", Duration::from_millis(3));
    }

    #[test]
    fn timing_guard_measures_duration() {
        let mut recorded = None;
        {
            let _guard = TimingGuard::new(|d| recorded = Some(d));
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(recorded.is_some_and(|d| d >= Duration::from_millis(10)));
    }

    #[test]
    fn callback_timer_records_on_drop() {
        let metrics = FlowMetrics::new();
        let guard = time_callback(&metrics, "lookup_complete");
        assert!(guard.elapsed() < Duration::from_secs(5));
    }
}
