//! Histogram metrics
//!
//! Histograms sample observations and count them in configurable buckets.

use crate::{InstrumentDesc, MetricsRegistry, Result};
use prometheus::{Histogram, HistogramVec};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Default histogram buckets for latencies (in seconds)
pub const DEFAULT_LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Default histogram buckets for sizes (in bytes): 100 growing by 10x, five bounds
pub const DEFAULT_SIZE_BUCKETS: &[f64] = &[100.0, 1_000.0, 10_000.0, 100_000.0, 1_000_000.0];

struct HistogramInner {
    desc: InstrumentDesc,
    vec: HistogramVec,
}

/// Handle to a registered histogram family
#[derive(Clone)]
pub struct HistogramHandle {
    inner: Arc<HistogramInner>,
}

impl HistogramHandle {
    pub(crate) fn new(desc: InstrumentDesc, vec: HistogramVec) -> Self {
        if desc.label_names().is_empty() {
            let no_labels: [&str; 0] = [];
            vec.with_label_values(&no_labels);
        }
        Self {
            inner: Arc::new(HistogramInner { desc, vec }),
        }
    }

    /// Metric name
    pub fn name(&self) -> &str {
        self.inner.desc.name()
    }

    /// Help text from the first registration
    pub fn help(&self) -> &str {
        self.inner.desc.help()
    }

    /// Label names in declaration order
    pub fn label_names(&self) -> &[String] {
        self.inner.desc.label_names()
    }

    /// Bucket upper bounds, ascending
    pub fn buckets(&self) -> &[f64] {
        self.inner.desc.buckets().unwrap_or(DEFAULT_LATENCY_BUCKETS)
    }

    /// Full descriptor of the histogram
    pub fn desc(&self) -> &InstrumentDesc {
        &self.inner.desc
    }

    /// Series for label values given in declaration order
    pub fn with_labels(&self, values: &[&str]) -> Result<HistogramSeries> {
        Ok(HistogramSeries(
            self.inner.vec.get_metric_with_label_values(values)?,
        ))
    }

    /// Series for label values given by name, in any order
    pub fn with_label_map(&self, labels: &HashMap<&str, &str>) -> Result<HistogramSeries> {
        Ok(HistogramSeries(self.inner.vec.get_metric_with(labels)?))
    }

    /// Whether both handles point at the same registered instrument
    pub fn same_instrument(&self, other: &HistogramHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for HistogramHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HistogramHandle")
            .field("desc", &self.inner.desc)
            .finish()
    }
}

/// One time series of a histogram
#[derive(Clone)]
pub struct HistogramSeries(Histogram);

impl HistogramSeries {
    /// Record one observation; count and sum accumulate alongside the buckets
    pub fn observe(&self, value: f64) {
        self.0.observe(value);
    }

    /// Number of observations recorded
    pub fn sample_count(&self) -> u64 {
        self.0.get_sample_count()
    }

    /// Sum of all observed values
    pub fn sample_sum(&self) -> f64 {
        self.0.get_sample_sum()
    }
}

/// Histogram builder
///
/// # Examples
///
/// ```
/// use prometrics_metrics::*;
///
/// let registry = MetricsRegistry::new();
/// let histogram = HistogramBuilder::new("db_query_duration_seconds", "Query duration")
///     .labels(&["operation"])
///     .latency_buckets()
///     .register(&registry)
///     .unwrap();
///
/// histogram.with_labels(&["SELECT"]).unwrap().observe(0.05);
/// ```
pub struct HistogramBuilder {
    name: String,
    help: String,
    label_names: Vec<String>,
    buckets: Option<Vec<f64>>,
}

impl HistogramBuilder {
    /// Create a new histogram builder
    pub fn new(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            label_names: Vec::new(),
            buckets: None,
        }
    }

    /// Set label names
    pub fn labels(mut self, labels: &[&str]) -> Self {
        self.label_names = labels.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Set custom buckets
    pub fn buckets(mut self, buckets: Vec<f64>) -> Self {
        self.buckets = Some(buckets);
        self
    }

    /// Use default latency buckets
    pub fn latency_buckets(mut self) -> Self {
        self.buckets = Some(DEFAULT_LATENCY_BUCKETS.to_vec());
        self
    }

    /// Use default size buckets
    pub fn size_buckets(mut self) -> Self {
        self.buckets = Some(DEFAULT_SIZE_BUCKETS.to_vec());
        self
    }

    /// Get or create the histogram in `registry`
    pub fn register(self, registry: &MetricsRegistry) -> Result<HistogramHandle> {
        let label_refs: Vec<&str> = self.label_names.iter().map(|s| s.as_str()).collect();
        registry.get_or_create_histogram(&self.name, &self.help, &label_refs, self.buckets)
    }
}
