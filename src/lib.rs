// Prometrics - Prometheus instrumentation for HTTP services
//
// This library re-exports the request/response seam and logging setup from
// prometrics-core and, with the `metrics` feature, the instrument registry and
// everything built on it.

// Re-export core functionality
pub use prometrics_core::*;

// Re-export optional crates
#[cfg(feature = "metrics")]
pub use prometrics_metrics;

pub use tokio_util::sync::CancellationToken;

// Prelude for common imports
pub mod prelude {
    pub use crate::{
        CancellationToken, Error, HandlerFn, HttpRequest, HttpResponse, Middleware,
        MiddlewareChain, Next, handler_fn,
    };

    pub use crate::logging::{LogConfig, LogFormat, LogLevel, LogOutput};

    #[cfg(feature = "metrics")]
    pub use prometrics_metrics::{
        CounterBuilder, GaugeBuilder, HealthMetrics, HealthMetricsMiddleware, HealthSampler,
        HistogramBuilder, HttpMetrics, MetricsConfig, MetricsError, MetricsRegistry,
        OperationTimer, OperationTracker, Prometrics, RequestMetricsMiddleware, SamplerHandle,
        SamplerState, Validate, metrics_handler, start_health_sampler,
    };
}
