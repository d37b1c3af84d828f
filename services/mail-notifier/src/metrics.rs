//! Prometheus metrics exposition
//!
//! The library crates emit through the `metrics` facade:
//!
//! - `session_refresh_total` (counter): label `outcome`
//! - `session_authorize_total` (counter): label `outcome`
//! - `gate_calls_total` (counter): labels `operation`, `outcome`
//! - `gate_auth_retries_total` (counter): label `operation`
//! - `monitor_ticks_total` (counter): label `outcome`
//! - `monitor_messages_total` (counter): label `action`
//! - `monitor_unread_messages` (gauge)

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// The handle's `render()` method produces the Prometheus text exposition format
/// suitable for serving on a `/metrics` endpoint.
pub fn install_recorder() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");
    describe();
    handle
}

/// Attach HELP text to every metric the service emits.
pub fn describe() {
    metrics::describe_counter!(
        "session_refresh_total",
        "Token refresh attempts by outcome (success, invalid_grant, transient)"
    );
    metrics::describe_counter!(
        "session_authorize_total",
        "Interactive authorization attempts by outcome"
    );
    metrics::describe_counter!(
        "gate_calls_total",
        "Provider API calls made through the gate, by operation and outcome"
    );
    metrics::describe_counter!(
        "gate_auth_retries_total",
        "Provider calls retried after a 401 and a forced revalidation"
    );
    metrics::describe_counter!("monitor_ticks_total", "Poll ticks by outcome");
    metrics::describe_counter!(
        "monitor_messages_total",
        "New messages by what happened to them"
    );
    metrics::describe_gauge!(
        "monitor_unread_messages",
        "Unread messages in the inbox at the last poll"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusRecorder;

    /// Create an isolated recorder/handle pair for unit tests.
    /// Uses build_recorder() instead of install_recorder() because only one
    /// global recorder can exist per process.
    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    #[test]
    fn described_metrics_render_with_help_text() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        describe();
        metrics::counter!("monitor_ticks_total", "outcome" => "idle").increment(2);
        metrics::gauge!("monitor_unread_messages").set(7.0);

        let output = handle.render();
        assert!(output.contains("# HELP monitor_ticks_total Poll ticks by outcome"));
        assert!(output.contains("monitor_ticks_total{outcome=\"idle\"} 2"));
        assert!(output.contains("monitor_unread_messages 7"));
    }
}
