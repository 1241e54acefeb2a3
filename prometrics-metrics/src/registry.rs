//! Instrument registry with get-or-create semantics
//!
//! A [`MetricsRegistry`] owns one prometheus [`Registry`] and remembers every
//! instrument created through it by name. Asking for an existing name returns
//! the same instrument, so independent components can declare the metrics they
//! need without coordinating who registers first.

use crate::{CounterHandle, GaugeHandle, HistogramHandle, MetricsError, Result};
use parking_lot::Mutex;
use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, error};

/// The three instrument kinds a registry can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstrumentKind {
    Counter,
    Gauge,
    Histogram,
}

impl InstrumentKind {
    /// Lowercase name of the kind
    pub fn as_str(&self) -> &'static str {
        match self {
            InstrumentKind::Counter => "counter",
            InstrumentKind::Gauge => "gauge",
            InstrumentKind::Histogram => "histogram",
        }
    }
}

impl fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declaration captured when an instrument is first created.
///
/// Later requests for the same name never alter it.
#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentDesc {
    name: String,
    help: String,
    label_names: Vec<String>,
    buckets: Option<Vec<f64>>,
}

impl InstrumentDesc {
    pub(crate) fn new(
        name: &str,
        help: &str,
        label_names: &[&str],
        buckets: Option<Vec<f64>>,
    ) -> Self {
        Self {
            name: name.to_string(),
            help: help.to_string(),
            label_names: label_names.iter().map(|s| s.to_string()).collect(),
            buckets,
        }
    }

    /// Metric name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Help text
    pub fn help(&self) -> &str {
        &self.help
    }

    /// Label names in declaration order
    pub fn label_names(&self) -> &[String] {
        &self.label_names
    }

    /// Histogram bucket upper bounds, `None` for counters and gauges
    pub fn buckets(&self) -> Option<&[f64]> {
        self.buckets.as_deref()
    }

    /// Compare label sets ignoring order
    fn check_labels(&self, requested: &[&str]) -> Result<()> {
        let mut declared: Vec<&str> = self.label_names.iter().map(String::as_str).collect();
        let mut wanted: Vec<&str> = requested.to_vec();
        declared.sort_unstable();
        wanted.sort_unstable();

        if declared == wanted {
            Ok(())
        } else {
            Err(MetricsError::LabelConflict {
                name: self.name.clone(),
                declared: self.label_names.clone(),
                requested: requested.iter().map(|s| s.to_string()).collect(),
            })
        }
    }
}

#[derive(Default)]
struct Instruments {
    counters: HashMap<String, CounterHandle>,
    gauges: HashMap<String, GaugeHandle>,
    histograms: HashMap<String, HistogramHandle>,
    process_collector: bool,
}

impl Instruments {
    fn kind_of(&self, name: &str) -> Option<InstrumentKind> {
        if self.counters.contains_key(name) {
            Some(InstrumentKind::Counter)
        } else if self.gauges.contains_key(name) {
            Some(InstrumentKind::Gauge)
        } else if self.histograms.contains_key(name) {
            Some(InstrumentKind::Histogram)
        } else {
            None
        }
    }

    fn claim(&self, name: &str, requested: InstrumentKind) -> Result<()> {
        match self.kind_of(name) {
            Some(existing) if existing != requested => Err(MetricsError::KindConflict {
                name: name.to_string(),
                existing,
                requested,
            }),
            _ => Ok(()),
        }
    }

    fn len(&self) -> usize {
        self.counters.len() + self.gauges.len() + self.histograms.len()
    }
}

/// Registry of named counters, gauges and histograms.
///
/// Creation of instruments is serialized by one lock. Recording values on a
/// series obtained from a handle never touches that lock.
///
/// # Examples
///
/// ```
/// use prometrics_metrics::*;
///
/// let registry = MetricsRegistry::new();
/// let jobs = registry
///     .get_or_create_counter("jobs_total", "Jobs processed", &["queue"])
///     .unwrap();
/// jobs.with_labels(&["default"]).unwrap().increment();
///
/// let again = registry
///     .get_or_create_counter("jobs_total", "ignored help", &["queue"])
///     .unwrap();
/// assert!(jobs.same_instrument(&again));
/// assert!(registry.render().contains("jobs_total{queue=\"default\"} 1"));
/// ```
pub struct MetricsRegistry {
    registry: Registry,
    instruments: Mutex<Instruments>,
}

impl MetricsRegistry {
    /// Create a registry backed by a fresh prometheus registry
    pub fn new() -> Self {
        Self::with_registry(Registry::new())
    }

    /// Create a registry that registers into an existing prometheus registry
    pub fn with_registry(registry: Registry) -> Self {
        Self {
            registry,
            instruments: Mutex::new(Instruments::default()),
        }
    }

    /// Get the counter called `name`, creating and registering it on first use.
    ///
    /// On later calls `help` is ignored. The label names must match the first
    /// declaration as a set.
    pub fn get_or_create_counter(
        &self,
        name: &str,
        help: &str,
        label_names: &[&str],
    ) -> Result<CounterHandle> {
        let mut instruments = self.instruments.lock();

        if let Some(existing) = instruments.counters.get(name) {
            existing.desc().check_labels(label_names)?;
            return Ok(existing.clone());
        }
        instruments.claim(name, InstrumentKind::Counter)?;

        let vec = CounterVec::new(Opts::new(name, help), label_names)?;
        self.registry.register(Box::new(vec.clone()))?;

        let handle = CounterHandle::new(InstrumentDesc::new(name, help, label_names, None), vec);
        instruments.counters.insert(name.to_string(), handle.clone());
        debug!(metric = name, labels = ?label_names, "Registered counter");

        Ok(handle)
    }

    /// Get the gauge called `name`, creating and registering it on first use
    pub fn get_or_create_gauge(
        &self,
        name: &str,
        help: &str,
        label_names: &[&str],
    ) -> Result<GaugeHandle> {
        let mut instruments = self.instruments.lock();

        if let Some(existing) = instruments.gauges.get(name) {
            existing.desc().check_labels(label_names)?;
            return Ok(existing.clone());
        }
        instruments.claim(name, InstrumentKind::Gauge)?;

        let vec = GaugeVec::new(Opts::new(name, help), label_names)?;
        self.registry.register(Box::new(vec.clone()))?;

        let handle = GaugeHandle::new(InstrumentDesc::new(name, help, label_names, None), vec);
        instruments.gauges.insert(name.to_string(), handle.clone());
        debug!(metric = name, labels = ?label_names, "Registered gauge");

        Ok(handle)
    }

    /// Get the histogram called `name`, creating and registering it on first use.
    ///
    /// `buckets` of `None` (or an empty list) selects
    /// [`DEFAULT_LATENCY_BUCKETS`](crate::DEFAULT_LATENCY_BUCKETS). Buckets are
    /// ignored when the histogram already exists.
    pub fn get_or_create_histogram(
        &self,
        name: &str,
        help: &str,
        label_names: &[&str],
        buckets: Option<Vec<f64>>,
    ) -> Result<HistogramHandle> {
        let mut instruments = self.instruments.lock();

        if let Some(existing) = instruments.histograms.get(name) {
            existing.desc().check_labels(label_names)?;
            return Ok(existing.clone());
        }
        instruments.claim(name, InstrumentKind::Histogram)?;

        let buckets = match buckets {
            Some(buckets) if !buckets.is_empty() => buckets,
            _ => crate::DEFAULT_LATENCY_BUCKETS.to_vec(),
        };
        validate_buckets(name, &buckets)?;

        let opts = HistogramOpts::new(name, help).buckets(buckets.clone());
        let vec = HistogramVec::new(opts, label_names)?;
        self.registry.register(Box::new(vec.clone()))?;

        let handle = HistogramHandle::new(
            InstrumentDesc::new(name, help, label_names, Some(buckets)),
            vec,
        );
        instruments.histograms.insert(name.to_string(), handle.clone());
        debug!(metric = name, labels = ?label_names, "Registered histogram");

        Ok(handle)
    }

    /// Whether any instrument is registered under `name`
    pub fn contains(&self, name: &str) -> bool {
        self.instruments.lock().kind_of(name).is_some()
    }

    /// Kind of the instrument registered under `name`
    pub fn kind_of(&self, name: &str) -> Option<InstrumentKind> {
        self.instruments.lock().kind_of(name)
    }

    /// Number of instruments created through this registry
    pub fn len(&self) -> usize {
        self.instruments.lock().len()
    }

    /// Whether no instrument has been created yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The underlying prometheus registry, for collectors created elsewhere
    pub fn prometheus_registry(&self) -> &Registry {
        &self.registry
    }

    /// Collect all metric families
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Render all metrics in the Prometheus text exposition format
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            error!("Failed to encode metrics: {}", e);
            return String::from("# Error encoding metrics\n");
        }

        String::from_utf8(buffer)
            .unwrap_or_else(|_| String::from("# Error converting metrics to UTF-8\n"))
    }

    /// Register prometheus' process collector (Linux only, reads procfs).
    ///
    /// Registering it again on the same registry is a no-op.
    #[cfg(target_os = "linux")]
    pub fn register_process_collector(&self) -> Result<()> {
        let mut instruments = self.instruments.lock();
        if instruments.process_collector {
            return Ok(());
        }

        self.registry.register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ))?;
        instruments.process_collector = true;
        debug!("Registered process collector");
        Ok(())
    }

    /// Register prometheus' process collector (Linux only, reads procfs)
    #[cfg(not(target_os = "linux"))]
    pub fn register_process_collector(&self) -> Result<()> {
        tracing::warn!("Process collector is only available on Linux, skipping");
        Ok(())
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let instruments = self.instruments.lock();
        f.debug_struct("MetricsRegistry")
            .field("counters", &instruments.counters.len())
            .field("gauges", &instruments.gauges.len())
            .field("histograms", &instruments.histograms.len())
            .finish()
    }
}

fn validate_buckets(name: &str, buckets: &[f64]) -> Result<()> {
    if buckets.iter().any(|b| b.is_nan()) {
        return Err(MetricsError::InvalidBuckets {
            name: name.to_string(),
            reason: "bucket bound is NaN".to_string(),
        });
    }

    if let Some(pair) = buckets.windows(2).find(|pair| pair[0] >= pair[1]) {
        return Err(MetricsError::InvalidBuckets {
            name: name.to_string(),
            reason: format!("bounds must be strictly increasing, {} >= {}", pair[0], pair[1]),
        });
    }

    Ok(())
}
