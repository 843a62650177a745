//! ---
//! cc_section: "03-persistence-logging"
//! cc_subsection: "module"
//! cc_type: "source"
//! cc_scope: "code"
//! cc_description: "Metrics collection and export utilities."
//! cc_version: "v0.1.0"
//! cc_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use prometheus::{
    Encoder, GaugeVec, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts,
    Registry, TextEncoder,
};

/// Shared registry type used across services.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Render every family in the registry using the Prometheus text format.
pub fn encode(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    encoder
        .encode_to_string(&registry.gather())
        .context("failed to encode metrics")
}

/// Content type emitted alongside [`encode`] output.
pub fn content_type() -> String {
    TextEncoder::new().format_type().to_owned()
}

/// Metrics recorded by the daemon process itself.
#[derive(Clone)]
pub struct DaemonMetrics {
    starts_total: IntCounter,
    config_load_seconds: Histogram,
    build_info: GaugeVec,
}

impl DaemonMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let starts_total = IntCounter::with_opts(Opts::new(
            "chaoscraftd_starts_total",
            "Total number of times the control-plane daemon has initialised",
        ))?;
        registry.register(Box::new(starts_total.clone()))?;

        let buckets = prometheus::exponential_buckets(0.001, 2.0, 16)
            .context("failed to construct histogram buckets")?;
        let config_load_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "chaoscraftd_config_load_seconds",
                "Time spent loading and validating configuration",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(config_load_seconds.clone()))?;

        let build_info = GaugeVec::new(
            Opts::new(
                "chaoscraftd_build_info",
                "Build metadata for the running daemon binary",
            ),
            &["version", "profile", "store_backend"],
        )?;
        registry.register(Box::new(build_info.clone()))?;

        Ok(Self {
            starts_total,
            config_load_seconds,
            build_info,
        })
    }

    pub fn inc_start(&self) {
        self.starts_total.inc();
    }

    pub fn observe_config_load(&self, seconds: f64) {
        self.config_load_seconds.observe(seconds);
    }

    pub fn set_build_info(&self, version: &str, profile: &str, store_backend: &str) {
        self.build_info
            .with_label_values(&[version, profile, store_backend])
            .set(1.0);
    }
}

impl std::fmt::Debug for DaemonMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonMetrics").finish_non_exhaustive()
    }
}

/// Request volume and latency for the HTTP surface, labelled by method, route and status.
#[derive(Clone, Debug)]
pub struct HttpMetrics {
    requests_total: IntCounterVec,
    request_duration: HistogramVec,
}

impl HttpMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let requests_total = IntCounterVec::new(
            Opts::new(
                "chaoscraft_http_requests_total",
                "Total HTTP requests served by the control plane",
            ),
            &["method", "path", "status"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "chaoscraft_http_request_duration_seconds",
                "Latency of HTTP requests served by the control plane",
            )
            .buckets(prometheus::exponential_buckets(0.0005, 2.0, 16)?),
            &["method", "path", "status"],
        )?;
        registry.register(Box::new(request_duration.clone()))?;

        Ok(Self {
            requests_total,
            request_duration,
        })
    }

    pub fn observe(&self, method: &str, path: &str, status: u16, elapsed: Duration) {
        let status = status.to_string();
        let labels = [method, path, status.as_str()];
        self.requests_total.with_label_values(&labels).inc();
        self.request_duration
            .with_label_values(&labels)
            .observe(elapsed.as_secs_f64());
    }
}

pub use prometheus;
