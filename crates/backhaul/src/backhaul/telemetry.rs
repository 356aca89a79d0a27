use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Installs the process-wide Prometheus recorder. Call once at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")?;
    describe();
    Ok(handle)
}

fn describe() {
    metrics::describe_counter!(
        "backhaul_public_connections_total",
        "Public connections accepted on tunnel ports."
    );
    metrics::describe_counter!(
        "backhaul_pending_claimed_total",
        "Pending public connections claimed by an agent data connection."
    );
    metrics::describe_counter!(
        "backhaul_pending_expired_total",
        "Pending public connections closed because no agent claimed them in time."
    );
    metrics::describe_counter!(
        "backhaul_bridge_bytes_total",
        metrics::Unit::Bytes,
        "Bytes spliced between public and agent connections."
    );
    metrics::describe_gauge!("backhaul_tunnels", "Tunnels currently exposed by the relay.");
    metrics::describe_gauge!(
        "backhaul_control_sessions",
        "Authenticated agent control connections."
    );
}
