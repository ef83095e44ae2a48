//! Prometheus metrics exposition
//!
//! Registers and exposes the metrics surfaced by the rotation engine:
//!
//! - `rotation_requests_total` (counter): labels `status`, `account`
//! - `rotation_request_duration_seconds` (histogram): label `status`
//! - `rotation_retries_total` (counter)
//! - `rotation_account_state_transitions_total` (counter): labels `from`, `to` — recorded in `anthropic_pool::Pool`
//! - `refresh_attempts_total` (counter): label `outcome` — recorded in `anthropic_pool::refresh`

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// Configures `rotation_request_duration_seconds` with histogram buckets so
/// it renders as a Prometheus histogram (with `_bucket` lines for
/// `histogram_quantile()` queries) rather than the default summary. Bucket
/// boundaries cover 5ms to 60s, matching the rotation middleware's
/// configurable upstream timeout range.
pub fn install_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full(
                "rotation_request_duration_seconds".to_string(),
            ),
            &[
                0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
            ],
        )
        .expect("failed to set histogram buckets")
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a completed rotation request, labeled by final status and the
/// account that served it (or "none" when the pool was exhausted).
pub fn record_request(status: u16, account: &str, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!("rotation_requests_total", "status" => status_str.clone(), "account" => account.to_string())
        .increment(1);
    metrics::histogram!("rotation_request_duration_seconds", "status" => status_str)
        .record(duration_secs);
}

/// Record one retry (a 429 that caused a second attempt on a different account).
pub fn record_retry() {
    metrics::counter!("rotation_retries_total").increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusRecorder;

    #[test]
    fn record_functions_do_not_panic_without_recorder() {
        record_request(200, "acct-1", 0.05);
        record_retry();
    }

    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Full(
                    "rotation_request_duration_seconds".to_string(),
                ),
                &[
                    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
                ],
            )
            .expect("failed to set histogram buckets")
            .build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    #[test]
    fn record_request_increments_counter_and_histogram() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_request(200, "acct-1", 0.042);
        record_request(429, "acct-2", 1.5);

        let output = handle.render();
        assert!(output.contains("rotation_requests_total"));
        assert!(output.contains("status=\"200\""));
        assert!(output.contains("account=\"acct-1\""));
        assert!(output.contains("status=\"429\""));
        assert!(output.contains("rotation_request_duration_seconds_bucket"));
    }

    #[test]
    fn record_retry_increments_counter() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_retry();
        record_retry();

        let output = handle.render();
        assert!(output.contains("rotation_retries_total"));
    }

    #[test]
    fn histogram_buckets_cover_expected_range() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_request(200, "acct-1", 0.003);

        let output = handle.render();
        assert!(output.contains("le=\"0.005\""));
        assert!(output.contains("le=\"60\""));
        assert!(output.contains("le=\"+Inf\""));
    }
}
