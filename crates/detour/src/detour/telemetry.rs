use std::sync::Arc;

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")?;
    describe();
    Ok(handle)
}

fn describe() {
    metrics::describe_counter!(
        "detour_transport_connections_total",
        "Transport connections accepted by the server"
    );
    metrics::describe_counter!(
        "detour_sessions_opened_total",
        "Relay sessions established: outbound dials on the server, bridged clients on the local side"
    );
    metrics::describe_counter!("detour_dial_errors_total", "Outbound dials that failed or timed out");
    metrics::describe_counter!(
        "detour_reconnects_total",
        "RECONNECT messages sent or acted upon"
    );
    metrics::describe_counter!(
        "detour_auth_errors_total",
        "Frames dropped because they failed to authenticate"
    );
    metrics::describe_counter!(
        "detour_sessions_evicted_total",
        "Sessions closed by idle housekeeping"
    );
    metrics::describe_counter!(
        "detour_bytes_upstream_total",
        "Client bytes carried toward destinations"
    );
    metrics::describe_counter!(
        "detour_bytes_downstream_total",
        "Destination bytes carried back to clients"
    );
    metrics::describe_gauge!("detour_active_sessions", "Sessions currently tracked by the server");
}

pub type SharedPrometheusHandle = Arc<PrometheusHandle>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptions_cover_both_modes() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            describe();
            metrics::counter!("detour_sessions_opened_total").increment(1);
        });

        let text = handle.render();
        assert!(text.contains(
            "# HELP detour_sessions_opened_total Relay sessions established: outbound dials on the server, bridged clients on the local side"
        ));
        assert!(text.contains("detour_sessions_opened_total 1"));
    }
}
