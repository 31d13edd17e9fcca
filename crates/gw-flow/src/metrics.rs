//! Prometheus-compatible metrics for admission, dispatch, and HTTP serving

use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

pub use metrics_exporter_prometheus::PrometheusHandle;

/// Install the global Prometheus recorder and return a handle for rendering
pub fn install_prometheus_recorder() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// Record an admission decision (`admitted`, `quota_exhausted`, `overload_rejected`)
pub fn record_admission(result: &'static str) {
    counter!("gw_admission_decisions_total", "result" => result).increment(1);
}

pub fn record_tokens_refilled(tokens: i64) {
    counter!("gw_admission_tokens_refilled_total").increment(tokens.max(0) as u64);
}

/// Current adaptive concurrency limit
pub fn set_oracle_limit(limit: u64) {
    gauge!("gw_overload_oracle_limit").set(limit as f64);
}

pub fn set_pool_active_workers(count: usize) {
    gauge!("gw_dispatch_active_workers").set(count as f64);
}

pub fn record_record_dispatched(topic: &str) {
    counter!("gw_records_dispatched_total", "topic" => topic.to_string()).increment(1);
}

/// Record a handler run and its latency
pub fn record_record_handled(topic: &str, duration: Duration) {
    counter!("gw_records_handled_total", "topic" => topic.to_string()).increment(1);
    histogram!("gw_record_handle_duration_seconds", "topic" => topic.to_string())
        .record(duration.as_secs_f64());
}

pub fn record_commit_failure(topic: &str) {
    counter!("gw_commit_failures_total", "topic" => topic.to_string()).increment(1);
}

pub fn record_fetch_error() {
    counter!("gw_fetch_errors_total").increment(1);
}

pub fn record_submit_error(reason: &'static str) {
    counter!("gw_dispatch_submit_errors_total", "reason" => reason).increment(1);
}

/// Record one served HTTP request under configurable metric names
pub fn record_http_request(
    counter_name: &str,
    histogram_name: &str,
    method: &str,
    path: &str,
    status: u16,
    duration: Duration,
) {
    counter!(
        counter_name.to_string(),
        "method" => method.to_string(),
        "path" => path.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!(
        histogram_name.to_string(),
        "method" => method.to_string(),
        "path" => path.to_string()
    )
    .record(duration.as_secs_f64());
}
