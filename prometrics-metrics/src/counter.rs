//! Counter metrics
//!
//! Counters are metrics that only increase over time.

use crate::{InstrumentDesc, MetricsError, MetricsRegistry, Result};
use prometheus::{Counter, CounterVec};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

struct CounterInner {
    desc: InstrumentDesc,
    vec: CounterVec,
}

/// Handle to a registered counter family.
///
/// Cheap to clone; every clone refers to the same instrument.
#[derive(Clone)]
pub struct CounterHandle {
    inner: Arc<CounterInner>,
}

impl CounterHandle {
    pub(crate) fn new(desc: InstrumentDesc, vec: CounterVec) -> Self {
        if desc.label_names().is_empty() {
            let no_labels: [&str; 0] = [];
            vec.with_label_values(&no_labels);
        }
        Self {
            inner: Arc::new(CounterInner { desc, vec }),
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

    /// Full descriptor of the counter
    pub fn desc(&self) -> &InstrumentDesc {
        &self.inner.desc
    }

    /// Series for label values given in declaration order
    pub fn with_labels(&self, values: &[&str]) -> Result<CounterSeries> {
        Ok(CounterSeries(
            self.inner.vec.get_metric_with_label_values(values)?,
        ))
    }

    /// Series for label values given by name, in any order
    pub fn with_label_map(&self, labels: &HashMap<&str, &str>) -> Result<CounterSeries> {
        Ok(CounterSeries(self.inner.vec.get_metric_with(labels)?))
    }

    /// Whether both handles point at the same registered instrument
    pub fn same_instrument(&self, other: &CounterHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for CounterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CounterHandle")
            .field("desc", &self.inner.desc)
            .finish()
    }
}

/// One time series of a counter
#[derive(Clone)]
pub struct CounterSeries(Counter);

impl CounterSeries {
    /// Add one to the series
    pub fn increment(&self) {
        self.0.inc();
    }

    /// Add `delta` to the series. Negative and NaN deltas are rejected.
    pub fn increment_by(&self, delta: f64) -> Result<()> {
        if delta.is_nan() || delta < 0.0 {
            return Err(MetricsError::NegativeDelta(delta));
        }
        self.0.inc_by(delta);
        Ok(())
    }

    /// Current value of the series
    pub fn value(&self) -> f64 {
        self.0.get()
    }
}

/// Counter builder
///
/// # Examples
///
/// ```
/// use prometrics_metrics::*;
///
/// let registry = MetricsRegistry::new();
/// let counter = CounterBuilder::new("http_requests_total", "Total HTTP requests")
///     .labels(&["method", "status"])
///     .register(&registry)
///     .unwrap();
///
/// counter.with_labels(&["GET", "200"]).unwrap().increment();
/// ```
pub struct CounterBuilder {
    name: String,
    help: String,
    label_names: Vec<String>,
}

impl CounterBuilder {
    /// Create a new counter builder
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

    /// Get or create the counter in `registry`
    pub fn register(self, registry: &MetricsRegistry) -> Result<CounterHandle> {
        let label_refs: Vec<&str> = self.label_names.iter().map(|s| s.as_str()).collect();
        registry.get_or_create_counter(&self.name, &self.help, &label_refs)
    }
}
