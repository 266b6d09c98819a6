//! Metrics recording and the optional Prometheus endpoint.
//!
//! Recording goes through the `metrics` facade and is a no-op until a
//! recorder is installed.

#[cfg(feature = "prometheus")]
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

#[cfg(feature = "prometheus")]
static PROMETHEUS: std::sync::OnceLock<PrometheusHandle> = std::sync::OnceLock::new();

/// Install the Prometheus recorder and return the handle for rendering.
///
/// The recorder is process-global; later calls return the first handle.
#[cfg(feature = "prometheus")]
pub fn install_prometheus_recorder() -> anyhow::Result<PrometheusHandle> {
    if let Some(handle) = PROMETHEUS.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus recorder: {e}"))?;
    Ok(PROMETHEUS.get_or_init(|| handle).clone())
}

pub fn record_session_open() {
    metrics::gauge!("sessions_active").increment(1.0);
    metrics::counter!("sessions_total").increment(1);
}

pub fn record_session_closed() {
    metrics::gauge!("sessions_active").decrement(1.0);
}

/// `direction` is `inbound` or `outbound`.
pub fn record_rtp_packets(direction: &'static str, count: u64) {
    metrics::counter!("rtp_packets_total", "direction" => direction).increment(count);
}

pub fn record_upstream_chunk() {
    metrics::counter!("upstream_chunks_total").increment(1);
}

pub fn record_error(kind: &'static str) {
    metrics::counter!("errors_total", "kind" => kind).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_does_not_panic() {
        record_session_open();
        record_rtp_packets("outbound", 3);
        record_upstream_chunk();
        record_error("encode");
        record_session_closed();
    }

    #[cfg(feature = "prometheus")]
    #[test]
    fn test_prometheus_render() {
        let handle = install_prometheus_recorder().unwrap();
        record_upstream_chunk();
        assert!(handle.render().contains("upstream_chunks_total"));
    }
}
