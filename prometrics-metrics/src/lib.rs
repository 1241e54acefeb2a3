//! Prometheus instrumentation for HTTP services
//!
//! This crate provides an instrument registry with get-or-create semantics and
//! the instrumentation built on it.
//!
//! # Features
//!
//! - **Instrument Registry** - Counters, gauges and histograms created once by name
//! - **Request Metrics** - In-flight, duration, count and size of HTTP requests
//! - **Operation Tracking** - Count and duration of business operations
//! - **Health Sampling** - Uptime, memory, threads and CPU on an interval
//! - **/metrics Endpoint** - Text exposition for Prometheus scraping
//!
//! # Quick Start
//!
//! ```
//! use prometrics_metrics::*;
//!
//! let metrics = Prometrics::new(MetricsConfig::default()).unwrap();
//!
//! let timer = metrics.operations().track("person", "create");
//! timer.finish();
//!
//! let text = metrics.render();
//! assert!(text.contains("crud_operations_total{object=\"person\",operation=\"create\"} 1"));
//! ```

pub mod config;
pub mod counter;
pub mod endpoint;
pub mod error;
pub mod gauge;
pub mod health;
pub mod histogram;
pub mod middleware;
pub mod registry;
pub mod tracker;

pub use config::*;
pub use counter::*;
pub use endpoint::*;
pub use error::*;
pub use gauge::*;
pub use health::*;
pub use histogram::*;
pub use middleware::*;
pub use prometheus;
pub use registry::*;
pub use tracker::*;

use prometrics_core::HandlerFn;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Everything a service needs, built from one [`MetricsConfig`]
pub struct Prometrics {
    registry: Arc<MetricsRegistry>,
    config: MetricsConfig,
    http: HttpMetrics,
    operations: OperationTracker,
    health: HealthSampler,
}

impl Prometrics {
    /// Validate `config` and create all instruments in a fresh registry
    pub fn new(config: MetricsConfig) -> Result<Self> {
        Self::with_registry(Arc::new(MetricsRegistry::new()), config)
    }

    /// Validate `config` and create all instruments in `registry`
    pub fn with_registry(registry: Arc<MetricsRegistry>, config: MetricsConfig) -> Result<Self> {
        config.validate()?;

        if config.process_collector {
            registry.register_process_collector()?;
        }

        let http = HttpMetrics::new(&registry, &config)?;
        let operations = OperationTracker::new(&registry, &config)?;
        let health = HealthSampler::new(HealthMetrics::new(&registry)?, config.cpu_sampling);

        info!(instruments = registry.len(), "Metrics initialized");

        Ok(Self {
            registry,
            config,
            http,
            operations,
            health,
        })
    }

    pub fn registry(&self) -> &Arc<MetricsRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    pub fn http(&self) -> &HttpMetrics {
        &self.http
    }

    pub fn operations(&self) -> &OperationTracker {
        &self.operations
    }

    pub fn health(&self) -> &HealthSampler {
        &self.health
    }

    /// Wrap `handler` so each call is recorded under `route`
    pub fn instrument_handler(&self, route: impl Into<String>, handler: HandlerFn) -> HandlerFn {
        self.http.instrument_handler(route, handler)
    }

    /// Middleware recording every request under its matched route
    pub fn request_middleware(&self) -> RequestMetricsMiddleware {
        RequestMetricsMiddleware::new(self.http.clone())
    }

    /// Middleware refreshing the health instruments on each request
    pub fn health_middleware(&self) -> HealthMetricsMiddleware {
        HealthMetricsMiddleware::new(self.health.clone())
    }

    /// Handler serving the registry for scraping
    pub fn metrics_handler(&self) -> HandlerFn {
        metrics_handler(self.registry.clone())
    }

    /// Start the health sampler at the configured interval
    pub fn start_health_sampler(&self, token: CancellationToken) -> Result<SamplerHandle> {
        start_health_sampler(self.health.clone(), self.config.health_interval_secs, token)
    }

    /// Render all metrics in the Prometheus text exposition format
    pub fn render(&self) -> String {
        self.registry.render()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundle_registers_all_instruments() {
        let metrics = Prometrics::new(MetricsConfig::default()).unwrap();

        for name in [
            "http_requests_total",
            "http_request_duration_seconds",
            "http_requests_in_flight",
            "http_request_size_bytes",
            "http_response_size_bytes",
            "crud_operations_total",
            "object_operation_duration_seconds",
            "object_count",
            "app_uptime_seconds",
            "app_memory_alloc_bytes",
            "app_goroutines",
            "app_gc_total",
            "app_cpu_usage_percent",
        ] {
            assert!(metrics.registry().contains(name), "missing {}", name);
        }
        assert_eq!(metrics.registry().len(), 13);
    }

    #[test]
    fn test_bundle_rejects_invalid_config() {
        let config = MetricsConfig {
            health_interval_secs: 0,
            ..Default::default()
        };
        assert!(matches!(
            Prometrics::new(config),
            Err(MetricsError::Config(ConfigError::ValidationError(_)))
        ));
    }

    #[test]
    fn test_bundles_share_a_registry() {
        let registry = Arc::new(MetricsRegistry::new());
        let first = Prometrics::with_registry(registry.clone(), MetricsConfig::default()).unwrap();
        let second = Prometrics::with_registry(registry.clone(), MetricsConfig::default()).unwrap();

        first.operations().increment_count("person");
        assert_eq!(second.operations().count("person"), 1.0);
        assert_eq!(registry.len(), 13);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_process_collector_is_opt_in() {
        let config = MetricsConfig {
            process_collector: true,
            ..Default::default()
        };
        let metrics = Prometrics::new(config).unwrap();
        assert!(metrics.render().contains("process_cpu_seconds_total"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_bundles_with_process_collector_share_a_registry() {
        let registry = Arc::new(MetricsRegistry::new());
        let config = MetricsConfig {
            process_collector: true,
            ..Default::default()
        };

        let first = Prometrics::with_registry(registry.clone(), config.clone()).unwrap();
        let second = Prometrics::with_registry(registry.clone(), config).unwrap();

        assert!(first.render().contains("process_cpu_seconds_total"));
        assert_eq!(second.registry().len(), 13);
    }
}
