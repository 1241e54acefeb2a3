//! Gauge metrics
//!
//! Gauges are metrics that can increase and decrease.

use crate::{InstrumentDesc, MetricsRegistry, Result};
use prometheus::{Gauge, GaugeVec};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

struct GaugeInner {
    desc: InstrumentDesc,
    vec: GaugeVec,
}

/// Handle to a registered gauge family
#[derive(Clone)]
pub struct GaugeHandle {
    inner: Arc<GaugeInner>,
}

impl GaugeHandle {
    pub(crate) fn new(desc: InstrumentDesc, vec: GaugeVec) -> Self {
        if desc.label_names().is_empty() {
            let no_labels: [&str; 0] = [];
            vec.with_label_values(&no_labels);
        }
        Self {
            inner: Arc::new(GaugeInner { desc, vec }),
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

    /// Full descriptor of the gauge
    pub fn desc(&self) -> &InstrumentDesc {
        &self.inner.desc
    }

    /// Series for label values given in declaration order
    pub fn with_labels(&self, values: &[&str]) -> Result<GaugeSeries> {
        Ok(GaugeSeries(self.inner.vec.get_metric_with_label_values(values)?))
    }

    /// Series for label values given by name, in any order
    pub fn with_label_map(&self, labels: &HashMap<&str, &str>) -> Result<GaugeSeries> {
        Ok(GaugeSeries(self.inner.vec.get_metric_with(labels)?))
    }

    /// Whether both handles point at the same registered instrument
    pub fn same_instrument(&self, other: &GaugeHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for GaugeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GaugeHandle")
            .field("desc", &self.inner.desc)
            .finish()
    }
}

/// One time series of a gauge
#[derive(Clone)]
pub struct GaugeSeries(Gauge);

impl GaugeSeries {
    /// Set the series to `value`
    pub fn set(&self, value: f64) {
        self.0.set(value);
    }

    /// Add one to the series
    pub fn increment(&self) {
        self.0.inc();
    }

    /// Subtract one from the series
    pub fn decrement(&self) {
        self.0.dec();
    }

    /// Add `delta` to the series
    pub fn increment_by(&self, delta: f64) {
        self.0.add(delta);
    }

    /// Subtract `delta` from the series
    pub fn decrement_by(&self, delta: f64) {
        self.0.sub(delta);
    }

    /// Current value of the series
    pub fn value(&self) -> f64 {
        self.0.get()
    }
}

/// Gauge builder
///
/// # Examples
///
/// ```
/// use prometrics_metrics::*;
///
/// let registry = MetricsRegistry::new();
/// let gauge = GaugeBuilder::new("queue_size", "Queue size")
///     .labels(&["queue_name"])
///     .register(&registry)
///     .unwrap();
///
/// gauge.with_labels(&["default"]).unwrap().set(10.0);
/// ```
pub struct GaugeBuilder {
    name: String,
    help: String,
    label_names: Vec<String>,
}

impl GaugeBuilder {
    /// Create a new gauge builder
    pub fn new(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            label_names: Vec::new(),
        }
    }

    /// Set label names
    pub fn labels(mut self, labels: &[&str]) -> Self {
        self.label_names = labels.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Get or create the gauge in `registry`
    pub fn register(self, registry: &MetricsRegistry) -> Result<GaugeHandle> {
        let label_refs: Vec<&str> = self.label_names.iter().map(|s| s.as_str()).collect();
        registry.get_or_create_gauge(&self.name, &self.help, &label_refs)
    }
}
