//! Prometheus metrics exposition
//!
//! Request-level metrics are recorded here; per-subscription gauges and
//! cooldown counters are emitted by the pool crate through the same `metrics`
//! facade and show up on the same `/metrics` page.
//!
//! - `proxy_requests_total` (counter): labels `status`, `method`, `client`
//! - `proxy_request_duration_seconds` (histogram): label `status`
//! - `proxy_upstream_errors_total` (counter): label `error_type`
//! - `proxy_failovers_total` (counter): labels `subscription`, `reason`

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Histogram buckets for request duration. Streamed completions can run for
/// minutes, so the range reaches the default 300s timeout.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("proxy_request_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .expect("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a completed proxy request.
pub fn record_request(status: u16, method: &str, client: &str, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!(
        "proxy_requests_total",
        "status" => status_str.clone(),
        "method" => method.to_string(),
        "client" => client.to_string()
    )
    .increment(1);
    metrics::histogram!("proxy_request_duration_seconds", "status" => status_str)
        .record(duration_secs);
}

/// Record an upstream error with a classification label.
pub fn record_upstream_error(error_type: &str) {
    metrics::counter!("proxy_upstream_errors_total", "error_type" => error_type.to_string())
        .increment(1);
}

/// Record a request moving off a subscription to try another.
pub fn record_failover(subscription: &str, reason: &str) {
    metrics::counter!(
        "proxy_failovers_total",
        "subscription" => subscription.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusRecorder;

    #[test]
    fn record_functions_do_not_panic_without_recorder() {
        record_request(200, "GET", "unknown", 0.05);
        record_upstream_error("timeout");
        record_failover("primary", "rate_limited");
    }

    /// Isolated recorder/handle pair; `install_recorder` may only run once per process.
    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = builder().build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    #[test]
    fn record_request_carries_client_label() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_request(200, "POST", "team-a", 0.042);
        record_request(503, "POST", "unknown", 0.001);

        let output = handle.render();
        assert!(output.contains("proxy_requests_total"));
        assert!(output.contains("client=\"team-a\""), "got: {output}");
        assert!(output.contains("client=\"unknown\""), "got: {output}");
        assert!(output.contains("status=\"503\""), "got: {output}");
        assert!(
            output.contains("proxy_request_duration_seconds_bucket"),
            "histogram must render _bucket lines"
        );
    }

    #[test]
    fn failover_counter_labels() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_failover("primary", "rate_limited");
        record_failover("secondary", "timeout");
        record_upstream_error("unreachable");

        let output = handle.render();
        assert!(output.contains("proxy_failovers_total"));
        assert!(output.contains("subscription=\"primary\""));
        assert!(output.contains("reason=\"timeout\""));
        assert!(output.contains("error_type=\"unreachable\""));
    }

    #[test]
    fn histogram_buckets_reach_request_timeout() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_request(200, "GET", "unknown", 0.003);

        let output = handle.render();
        assert!(output.contains("le=\"0.005\""), "5ms bucket must exist");
        assert!(output.contains("le=\"300\""), "300s bucket must exist");
        assert!(output.contains("le=\"+Inf\""));
    }
}
