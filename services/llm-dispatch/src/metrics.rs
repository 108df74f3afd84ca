//! Prometheus metrics exposition
//!
//! Metrics recorded across the workspace:
//!
//! - `llm_requests_total` (counter): label `status`
//! - `llm_request_duration_seconds` (histogram): label `status`
//! - `llm_retries_total` (counter): label `reason`
//! - `llm_route_switches_total` (counter)
//! - `llm_credential_errors_total` (counter): label `kind`
//! - `llm_proxy_health_checks_total` (counter): labels `class`, `result`
//! - `llm_gateway_requests_total` (counter): labels `route`, `status`

use anyhow::Context;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Request duration buckets, 50ms to 5 minutes (retries included).
const DURATION_BUCKETS: &[f64] = &[
    0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

fn builder() -> anyhow::Result<PrometheusBuilder> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("llm_request_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .context("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// `llm_request_duration_seconds` renders as a histogram (`_bucket` lines)
/// rather than the default summary.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    builder()?
        .install_recorder()
        .context("failed to install Prometheus recorder")
}

/// Record a gateway HTTP request by route and response status.
pub fn record_gateway_request(route: &'static str, status: u16) {
    metrics::counter!(
        "llm_gateway_requests_total",
        "route" => route,
        "status" => status.to_string()
    )
    .increment(1);
}

#[cfg(test)]
pub(crate) fn isolated_recorder() -> (
    metrics_exporter_prometheus::PrometheusRecorder,
    PrometheusHandle,
) {
    let recorder = builder().unwrap().build_recorder();
    let handle = recorder.handle();
    (recorder, handle)
}
