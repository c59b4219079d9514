// Metrics recorder setup.
use std::net::SocketAddr;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder with its built-in scrape listener.
pub fn init_metrics(bind: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(bind)
        .install()
        .with_context(|| format!("install metrics recorder on {bind}"))
}
