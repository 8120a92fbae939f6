//! A small in-process metrics registry.
//!
//! This is not a metrics *export* pipeline (no Prometheus/OTLP wiring) — it
//! exists so components can record counts and durations with named,
//! labelled recorders, and so tests can assert on them directly via
//! [`assert_counter`]. A real deployment would layer an exporter on top of
//! [`Registry`]; that's out of scope here.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;

/// A set of key/value label pairs identifying one recorder within a named
/// metric.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Attributes(BTreeMap<&'static str, &'static str>);

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }
}

impl From<&[(&'static str, &'static str)]> for Attributes {
    fn from(pairs: &[(&'static str, &'static str)]) -> Self {
        Self(pairs.iter().copied().collect())
    }
}

/// A monotonic counter of `u64` events.
#[derive(Debug, Clone, Default)]
pub struct U64Counter(Arc<AtomicU64>);

impl U64Counter {
    pub fn inc(&self, delta: u64) {
        self.0.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn fetch(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A histogram of observed durations, bucketed only by count + total for
/// simplicity (no quantile estimation).
#[derive(Debug, Clone, Default)]
pub struct DurationHistogram(Arc<Mutex<(u64, Duration)>>);

impl DurationHistogram {
    pub fn record(&self, d: Duration) {
        let mut inner = self.0.lock();
        inner.0 += 1;
        inner.1 += d;
    }

    pub fn count(&self) -> u64 {
        self.0.lock().0
    }

    pub fn total(&self) -> Duration {
        self.0.lock().1
    }
}

/// Something that can be created fresh for a new label set.
pub trait MetricKind: Default + Clone + Send + Sync + 'static {}
impl MetricKind for U64Counter {}
impl MetricKind for DurationHistogram {}

/// A single named metric, holding one recorder per distinct [`Attributes`].
pub struct Metric<T> {
    recorders: Arc<Mutex<BTreeMap<Attributes, T>>>,
}

impl<T> fmt::Debug for Metric<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metric").finish_non_exhaustive()
    }
}

impl<T: MetricKind> Metric<T> {
    /// Return the recorder for this label set, creating it on first use.
    pub fn recorder(&self, labels: impl Into<Attributes>) -> T {
        let labels = labels.into();
        let mut recorders = self.recorders.lock();
        recorders.entry(labels).or_default().clone()
    }

    fn get(&self, labels: &Attributes) -> Option<T> {
        self.recorders.lock().get(labels).cloned()
    }
}

struct NamedMetric {
    description: &'static str,
    // Type-erased storage; downcast on read since the registry is
    // single-process and the caller always knows the type it registered.
    any: Box<dyn std::any::Any + Send + Sync>,
}

/// A process-wide registry of named metrics.
#[derive(Debug, Default)]
pub struct Registry {
    metrics: Mutex<BTreeMap<&'static str, NamedMetric>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or fetch the already-registered) metric of type `T` under
    /// `name`. Re-registering the same name with a different `T` panics,
    /// mirroring a programmer error rather than a runtime condition.
    pub fn register_metric<T: MetricKind>(&self, name: &'static str, description: &'static str) -> Metric<T> {
        let mut metrics = self.metrics.lock();
        let entry = metrics.entry(name).or_insert_with(|| NamedMetric {
            description,
            any: Box::new(Metric::<T> {
                recorders: Arc::new(Mutex::new(BTreeMap::new())),
            }),
        });
        entry
            .any
            .downcast_ref::<Metric<T>>()
            .expect("metric registered twice under the same name with different types")
            .clone_handle()
    }

    #[doc(hidden)]
    pub fn get_for_test<T: MetricKind>(&self, name: &str, labels: &Attributes) -> Option<T> {
        let metrics = self.metrics.lock();
        metrics
            .get(name)?
            .any
            .downcast_ref::<Metric<T>>()?
            .get(labels)
    }
}

impl<T> Metric<T> {
    fn clone_handle(&self) -> Self {
        Self {
            recorders: Arc::clone(&self.recorders),
        }
    }
}

// Silence the unused-field warning; `description` exists for future
// introspection (e.g. a `/metrics` dump) but isn't read today.
#[allow(dead_code)]
fn _use(n: &NamedMetric) -> &str {
    n.description
}

/// Assert that the counter registered under `name` with `labels` currently
/// reads `value`. Panics with a readable message on mismatch or if the
/// metric was never recorded.
#[macro_export]
macro_rules! assert_counter {
    ($registry:expr, $ty:ty, $name:expr, labels = $labels:expr, value = $value:expr $(,)?) => {{
        let labels: $crate::Attributes = $labels;
        let got = $registry
            .get_for_test::<$ty>($name, &labels)
            .map(|c| c.fetch())
            .unwrap_or(0);
        assert_eq!(
            got, $value,
            "metric {} did not match expected value",
            $name
        );
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_records_per_label_set() {
        let registry = Registry::new();
        let metric = registry.register_metric::<U64Counter>("requests", "number of requests");
        let ok = metric.recorder(&[("result", "ok")][..]);
        let err = metric.recorder(&[("result", "err")][..]);

        ok.inc(1);
        ok.inc(2);
        err.inc(5);

        assert_eq!(ok.fetch(), 3);
        assert_eq!(err.fetch(), 5);
        assert_counter!(
            registry,
            U64Counter,
            "requests",
            labels = Attributes::from(&[("result", "ok")][..]),
            value = 3,
        );
    }

    #[test]
    fn duration_histogram_accumulates() {
        let h = DurationHistogram::default();
        h.record(Duration::from_millis(10));
        h.record(Duration::from_millis(20));
        assert_eq!(h.count(), 2);
        assert_eq!(h.total(), Duration::from_millis(30));
    }
}
