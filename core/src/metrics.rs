use anyhow::Result;

pub const CONNECTS_TOTAL: &str = "ws_session_connects_total";
pub const RECONNECTS_TOTAL: &str = "ws_session_reconnects_total";
pub const CONNECTION_LOST_TOTAL: &str = "ws_session_connection_lost_total";
pub const REQUESTS_TOTAL: &str = "ws_session_requests_total";
pub const PUSH_TOTAL: &str = "ws_session_push_total";
pub const PENDING: &str = "ws_session_pending";

/// Initialize the metrics exporter based on enabled features.
pub fn init_exporter() -> Result<()> {
    #[cfg(feature = "prometheus-exporter")]
    {
        use metrics_exporter_prometheus::PrometheusBuilder;
        PrometheusBuilder::new().install()?;
    }

    #[cfg(feature = "datadog-exporter")]
    {
        use metrics_exporter_dogstatsd::DogStatsDBuilder;
        DogStatsDBuilder::default().install()?;
    }

    Ok(())
}

/// Increment a session counter when metrics are enabled.
pub fn incr(name: &'static str) {
    if crate::config::metrics_enabled() {
        metrics::counter!(name).increment(1);
    }
}

/// Record the number of outstanding correlated requests.
pub fn set_pending(count: usize) {
    if crate::config::metrics_enabled() {
        metrics::gauge!(PENDING).set(count as f64);
    }
}
