//! Prometheus metrics.
//
//! Metrics organization:
//! - Gateway calls by disposition and outcome, with latency.
//! - Readiness and health probe attempts by result.
//! - Unit lifecycle transitions by target state.

use std::sync::OnceLock;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusHandle;

// Metric name constants
pub const GATEWAY_CALLS: &str = "devstack_gateway_calls_total";
pub const GATEWAY_LATENCY: &str = "devstack_gateway_latency_seconds";
pub const PROBE_ATTEMPTS: &str = "devstack_probe_attempts_total";
pub const UNIT_TRANSITIONS: &str = "devstack_unit_transitions_total";
pub const SECRET_BUNDLES: &str = "devstack_secret_bundles_total";

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the global Prometheus recorder.
/// Must be called BEFORE the tokio runtime starts.
pub fn init_prometheus_exporter() -> anyhow::Result<()> {
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus recorder: {}", e))?;

    PROMETHEUS_HANDLE
        .set(handle)
        .map_err(|_| anyhow::anyhow!("Prometheus handle already initialized"))?;
    Ok(())
}

/// Renders the exposition text, or `None` when no recorder is installed.
pub fn render() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|h| h.render())
}

/// Records one gateway call.
pub fn record_gateway_call(disposition: &str, outcome: &str, latency: Duration) {
    metrics::counter!(
        GATEWAY_CALLS,
        "disposition" => disposition.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    metrics::histogram!(GATEWAY_LATENCY, "disposition" => disposition.to_string())
        .record(latency.as_secs_f64());
}

/// Records one probe attempt.
pub fn record_probe(unit: &str, ok: bool) {
    let result = if ok { "success" } else { "failure" };
    metrics::counter!(PROBE_ATTEMPTS, "unit" => unit.to_string(), "result" => result).increment(1);
}

/// Records one lifecycle transition.
pub fn record_transition(unit: &str, state: &'static str) {
    metrics::counter!(UNIT_TRANSITIONS, "unit" => unit.to_string(), "state" => state).increment(1);
}

/// Records the outcome of resolving one secret bundle.
pub fn record_bundle(bundle: &str, ok: bool) {
    let result = if ok { "resolved" } else { "failed" };
    metrics::counter!(SECRET_BUNDLES, "bundle" => bundle.to_string(), "result" => result).increment(1);
}
