//! Business operation tracking
//!
//! Records how often and how long operations on domain objects run, e.g.
//! `("person", "create")`, and keeps a live count of objects per type.

use crate::{
    CounterHandle, CounterSeries, GaugeHandle, GaugeSeries, HistogramHandle, HistogramSeries,
    MetricsConfig, MetricsRegistry, Result,
};
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// Operation counters, durations and object counts.
///
/// # Examples
///
/// ```
/// use prometrics_metrics::*;
///
/// let registry = MetricsRegistry::new();
/// let tracker = OperationTracker::new(&registry, &MetricsConfig::default()).unwrap();
///
/// let timer = tracker.track("person", "create");
/// // ... create the person ...
/// timer.finish();
/// tracker.increment_count("person");
///
/// assert_eq!(tracker.count("person"), 1.0);
/// ```
#[derive(Clone)]
pub struct OperationTracker {
    operations_total: CounterHandle,
    operation_duration: HistogramHandle,
    object_count: GaugeHandle,
}

impl OperationTracker {
    /// Get or create the operation instruments in `registry`
    pub fn new(registry: &MetricsRegistry, config: &MetricsConfig) -> Result<Self> {
        let operations_total = registry.get_or_create_counter(
            "crud_operations_total",
            "Total CRUD operations",
            &["object", "operation"],
        )?;
        let operation_duration = registry.get_or_create_histogram(
            "object_operation_duration_seconds",
            "CRUD operation duration in seconds",
            &["object", "operation"],
            Some(config.operation_buckets.clone()),
        )?;
        let object_count = registry.get_or_create_gauge(
            "object_count",
            "Current number of objects",
            &["object"],
        )?;

        Ok(Self {
            operations_total,
            operation_duration,
            object_count,
        })
    }

    /// Start timing `operation` on `object`.
    ///
    /// The returned timer records once, on [`OperationTimer::finish`] or when
    /// it is dropped.
    pub fn track(&self, object: &str, operation: &str) -> OperationTimer {
        let labels = [object, operation];
        let series = match (
            self.operations_total.with_labels(&labels),
            self.operation_duration.with_labels(&labels),
        ) {
            (Ok(total), Ok(duration)) => Some((total, duration)),
            (Err(e), _) | (_, Err(e)) => {
                warn!(
                    object = %object,
                    operation = %operation,
                    error = %e,
                    "Failed to track operation"
                );
                None
            }
        };

        OperationTimer {
            series,
            start: Instant::now(),
        }
    }

    /// Set the object count for `object`
    pub fn set_count(&self, object: &str, count: f64) {
        self.with_count(object, |series| series.set(count));
    }

    pub fn increment_count(&self, object: &str) {
        self.with_count(object, |series| series.increment());
    }

    pub fn decrement_count(&self, object: &str) {
        self.with_count(object, |series| series.decrement());
    }

    /// Current object count for `object`
    pub fn count(&self, object: &str) -> f64 {
        self.object_count
            .with_labels(&[object])
            .map(|series| series.value())
            .unwrap_or_default()
    }

    fn with_count(&self, object: &str, f: impl FnOnce(&GaugeSeries)) {
        match self.object_count.with_labels(&[object]) {
            Ok(series) => f(&series),
            Err(e) => warn!(object = %object, error = %e, "Failed to update object count"),
        }
    }
}

/// Running timer for one tracked operation
#[must_use = "the operation is recorded when the timer is finished or dropped"]
pub struct OperationTimer {
    series: Option<(CounterSeries, HistogramSeries)>,
    start: Instant,
}

impl OperationTimer {
    /// Time elapsed since the operation started
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the timer and record the operation, returning its duration
    pub fn finish(mut self) -> Duration {
        self.record()
    }

    fn record(&mut self) -> Duration {
        let elapsed = self.start.elapsed();
        if let Some((total, duration)) = self.series.take() {
            duration.observe(elapsed.as_secs_f64());
            total.increment();
        }
        elapsed
    }
}

impl Drop for OperationTimer {
    fn drop(&mut self) {
        if self.series.is_some() {
            trace!("Operation timer dropped without finish, recording");
            self.record();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> (MetricsRegistry, OperationTracker) {
        let registry = MetricsRegistry::new();
        let tracker = OperationTracker::new(&registry, &MetricsConfig::default()).unwrap();
        (registry, tracker)
    }

    #[test]
    fn test_finish_records_count_and_duration() {
        let (_registry, tracker) = tracker();

        let timer = tracker.track("person", "create");
        std::thread::sleep(Duration::from_millis(120));
        let elapsed = timer.finish();
        assert!(elapsed >= Duration::from_millis(120));

        let labels = ["person", "create"];
        assert_eq!(tracker.operations_total.with_labels(&labels).unwrap().value(), 1.0);

        let duration = tracker.operation_duration.with_labels(&labels).unwrap();
        assert_eq!(duration.sample_count(), 1);
        assert!(duration.sample_sum() >= 0.12);
    }

    #[test]
    fn test_drop_records_exactly_once() {
        let (_registry, tracker) = tracker();

        {
            let _timer = tracker.track("order", "delete");
        }
        let timer = tracker.track("order", "delete");
        let _ = timer.finish();

        let labels = ["order", "delete"];
        assert_eq!(tracker.operations_total.with_labels(&labels).unwrap().value(), 2.0);
        assert_eq!(tracker.operation_duration.with_labels(&labels).unwrap().sample_count(), 2);
    }

    #[test]
    fn test_object_count_helpers() {
        let (_registry, tracker) = tracker();

        tracker.set_count("person", 42.0);
        tracker.increment_count("person");
        tracker.decrement_count("person");
        assert_eq!(tracker.count("person"), 42.0);

        tracker.decrement_count("ghost");
        assert_eq!(tracker.count("ghost"), -1.0);
    }

    #[test]
    fn test_trackers_share_instruments() {
        let registry = MetricsRegistry::new();
        let config = MetricsConfig::default();
        let first = OperationTracker::new(&registry, &config).unwrap();
        let second = OperationTracker::new(&registry, &config).unwrap();

        first.increment_count("invoice");
        second.increment_count("invoice");
        assert_eq!(first.count("invoice"), 2.0);
        assert_eq!(registry.len(), 3);
    }
}
