//! Prometheus scrape endpoint.
//!
//! The HTTP listener built into `metrics-exporter-prometheus` serves the
//! global recorder; every `logredirect_*` series described in
//! `logredirect_core::metrics` appears once it is installed.

use std::net::SocketAddr;

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;

use logredirect_core::config::MetricsConfig;
use logredirect_core::metrics as m;

/// The only path the built-in listener serves.
const SCRAPE_PATH: &str = "/metrics";

/// A validated `metrics` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrapeEndpoint {
    addr: SocketAddr,
}

impl ScrapeEndpoint {
    /// # Errors
    ///
    /// - `endpoint` other than `/metrics`
    /// - `listen_addr` that is not an IP literal
    pub fn from_config(config: &MetricsConfig) -> Result<Self> {
        if config.endpoint != SCRAPE_PATH {
            return Err(anyhow::anyhow!(
                "unsupported metrics endpoint '{}': only '{}' is served",
                config.endpoint,
                SCRAPE_PATH
            ));
        }
        let addr = format!("{}:{}", config.listen_addr, config.port)
            .parse()
            .map_err(|e| {
                anyhow::anyhow!(
                    "invalid metrics listen address '{}': {}",
                    config.listen_addr,
                    e
                )
            })?;
        Ok(Self { addr })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Installs the process-wide recorder, starts the listener and publishes
    /// the build info series. Fails if a recorder is already installed.
    pub fn install(self) -> Result<()> {
        if self.addr.ip().is_unspecified() {
            tracing::warn!(listen_addr = %self.addr, "metrics endpoint is exposed on all interfaces");
        }

        PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .install()
            .map_err(|e| anyhow::anyhow!("failed to install metrics recorder on {}: {}", self.addr, e))?;

        m::describe_all();
        metrics::gauge!(m::DAEMON_BUILD_INFO, "version" => env!("CARGO_PKG_VERSION")).set(1.0);

        tracing::info!(listen_addr = %self.addr, path = SCRAPE_PATH, "metrics endpoint active");
        Ok(())
    }
}

/// Validates `config` and installs the endpoint.
pub fn install_metrics_recorder(config: &MetricsConfig) -> Result<()> {
    ScrapeEndpoint::from_config(config)?.install()
}
