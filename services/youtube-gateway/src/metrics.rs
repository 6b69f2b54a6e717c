//! Prometheus metrics exposition
//!
//! Gateway metrics:
//!
//! - `gateway_requests_total` (counter): labels `route`, `status`
//! - `gateway_request_duration_seconds` (histogram): label `route`
//!
//! The key pool emits its own series through the same recorder:
//! `youtube_key_rotations_total`, `youtube_dispatch_attempts_total`,
//! `youtube_quota_units_total` and the `youtube_active_key_index` gauge.

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

const DURATION_METRIC: &str = "gateway_request_duration_seconds";

/// 5ms to 60s, wide enough for retried calls against a slow upstream.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(DURATION_METRIC.to_string()), DURATION_BUCKETS)
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// Durations render as a histogram with `_bucket` lines rather than the
/// exporter's default summary.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Handle backed by a recorder that is not installed globally.
#[cfg(test)]
pub fn test_handle() -> PrometheusHandle {
    PrometheusBuilder::new().build_recorder().handle()
}

/// Record a completed gateway request.
pub fn record_request(route: &'static str, status: u16, duration_secs: f64) {
    metrics::counter!("gateway_requests_total", "route" => route, "status" => status.to_string())
        .increment(1);
    metrics::histogram!(DURATION_METRIC, "route" => route).record(duration_secs);
}
