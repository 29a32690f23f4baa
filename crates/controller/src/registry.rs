//! Thread-safe metric registry.
//!
//! The registry is an explicit, injectable store of named series, never a
//! process-wide singleton, so multiple independent instances can coexist
//! in one test process. Naming follows Prometheus conventions:
//! `_total` suffix for counters, `_seconds` suffix for duration histograms.
//!
//! # Cardinality
//!
//! Every metric name carries a bounded number of distinct label
//! combinations. Combinations beyond `max_cardinality` are rejected and
//! accounted under `cardinality_rejected_total{metric}` instead of silently
//! growing memory.
//!
//! # Concurrency
//!
//! Synchronization is per-family: a `RwLock` over the name map (write-locked
//! only to insert a new family) and a `Mutex` over each family's label-set
//! map. Writers to unrelated series never contend, and `snapshot()` copies
//! out under short per-family critical sections without blocking writers for
//! unbounded time.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tracing::debug;

/// Default histogram bucket upper bounds, in seconds.
pub const DEFAULT_BUCKETS: [f64; 11] = [
    0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.000,
];

/// Metric kind of a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl MetricKind {
    /// Exposition `# TYPE` keyword.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        }
    }
}

/// Registry error type.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// A series name already exists with a different kind.
    #[error("Metric {metric} already registered as {registered}, requested {requested}")]
    DuplicateSeriesKind {
        metric: String,
        registered: &'static str,
        requested: &'static str,
    },
}

/// An instantaneous observation fed into the registry. Ephemeral; folded
/// into its series and not stored.
#[derive(Debug, Clone)]
pub struct MetricSample {
    pub name: String,
    pub labels: Vec<(String, String)>,
    pub value: f64,
    pub kind: MetricKind,
}

/// Accumulated value of one series at snapshot time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeriesValue {
    Counter(f64),
    Gauge(f64),
    Histogram {
        /// Bucket upper bounds (`+Inf` implied).
        bounds: Vec<f64>,
        /// Cumulative per-bucket counts, same length as `bounds`.
        counts: Vec<u64>,
        sum: f64,
        count: u64,
    },
}

/// Immutable copy of one series, safe to hold across registry writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesSnapshot {
    pub name: String,
    pub kind: MetricKind,
    /// Sorted by label key; includes the registry's static labels.
    pub labels: Vec<(String, String)>,
    pub value: SeriesValue,
}

/// Internally consistent copy of all series values.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    /// Sorted by (name, labels).
    pub series: Vec<SeriesSnapshot>,
}

enum Accumulator {
    Counter(f64),
    Gauge(f64),
    Histogram {
        counts: Vec<u64>,
        sum: f64,
        count: u64,
    },
}

struct Family {
    kind: MetricKind,
    /// Histogram bucket bounds; unused for counters and gauges.
    bounds: Arc<[f64]>,
    series: Mutex<BTreeMap<Vec<(String, String)>, Accumulator>>,
}

/// Thread-safe store of named metric series.
pub struct MetricRegistry {
    max_cardinality: usize,
    /// Static labels merged into every series identity, sorted by key.
    static_labels: Vec<(String, String)>,
    families: RwLock<HashMap<String, Arc<Family>>>,
    /// Per-metric rejection counts, surfaced in snapshots as
    /// `cardinality_rejected_total{metric}`.
    rejected: Mutex<BTreeMap<String, u64>>,
}

impl MetricRegistry {
    /// Create a registry with the given per-name cardinality cap and static
    /// labels.
    #[must_use]
    pub fn new(max_cardinality: usize, static_labels: Vec<(String, String)>) -> Self {
        let mut static_labels = static_labels;
        static_labels.sort();
        Self {
            max_cardinality,
            static_labels,
            families: RwLock::new(HashMap::new()),
            rejected: Mutex::new(BTreeMap::new()),
        }
    }

    /// Pre-register a series name with its kind.
    ///
    /// Label names are declarative; identity is always (name, sorted label
    /// set) at record time.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateSeriesKind` if `name` already exists with a
    /// different kind.
    pub fn register(
        &self,
        name: &str,
        kind: MetricKind,
        _label_names: &[&str],
    ) -> Result<(), RegistryError> {
        self.family(name, kind).map(|_| ())
    }

    /// Fold a sample into its series, creating the series on first use.
    ///
    /// Cardinality rejections are absorbed here: the sample is dropped,
    /// counted, and `Ok(())` is returned so callers never enter an error
    /// path for label-set growth.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateSeriesKind` if the name exists with a different
    /// kind, which is a programming error rather than a runtime condition.
    pub fn record(&self, sample: MetricSample) -> Result<(), RegistryError> {
        let family = self.family(&sample.name, sample.kind)?;
        let identity = self.identity(sample.labels);

        let mut series = lock_unpoisoned(&family.series);
        if let Some(accumulator) = series.get_mut(&identity) {
            fold(accumulator, sample.value, &family.bounds);
            return Ok(());
        }

        if series.len() >= self.max_cardinality {
            drop(series);
            let mut rejected = lock_unpoisoned(&self.rejected);
            *rejected.entry(sample.name.clone()).or_insert(0) += 1;
            debug!(
                target: "controller.registry",
                metric = %sample.name,
                "Label combination rejected by cardinality guard"
            );
            return Ok(());
        }

        let mut accumulator = new_accumulator(sample.kind, &family.bounds);
        fold(&mut accumulator, sample.value, &family.bounds);
        series.insert(identity, accumulator);
        Ok(())
    }

    /// Add `value` to a counter series. Kind conflicts are logged and
    /// swallowed; reconciliation never fails over metrics.
    pub fn inc_counter(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.record_infallible(name, labels, value, MetricKind::Counter);
    }

    /// Set a gauge series to `value`.
    pub fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.record_infallible(name, labels, value, MetricKind::Gauge);
    }

    /// Observe `value` into a histogram series.
    pub fn observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.record_infallible(name, labels, value, MetricKind::Histogram);
    }

    /// Immutable, internally consistent copy of all series values.
    ///
    /// Each family is locked only long enough to clone its map; writers to
    /// other families proceed concurrently.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let families: Vec<(String, Arc<Family>)> = {
            let map = read_unpoisoned(&self.families);
            map.iter()
                .map(|(name, family)| (name.clone(), Arc::clone(family)))
                .collect()
        };

        let mut series = Vec::new();
        for (name, family) in families {
            let copied: Vec<(Vec<(String, String)>, SeriesValue)> = {
                let guard = lock_unpoisoned(&family.series);
                guard
                    .iter()
                    .map(|(labels, accumulator)| {
                        (labels.clone(), to_value(accumulator, &family.bounds))
                    })
                    .collect()
            };
            for (labels, value) in copied {
                series.push(SeriesSnapshot {
                    name: name.clone(),
                    kind: family.kind,
                    labels,
                    value,
                });
            }
        }

        // Overflow accounting, synthesized as a regular counter family.
        {
            let rejected = lock_unpoisoned(&self.rejected);
            for (metric, count) in rejected.iter() {
                let labels =
                    self.identity(vec![("metric".to_string(), metric.clone())]);
                series.push(SeriesSnapshot {
                    name: "cardinality_rejected_total".to_string(),
                    kind: MetricKind::Counter,
                    labels,
                    value: SeriesValue::Counter(*count as f64),
                });
            }
        }

        series.sort_by(|a, b| (&a.name, &a.labels).cmp(&(&b.name, &b.labels)));
        MetricsSnapshot { series }
    }

    fn record_infallible(
        &self,
        name: &str,
        labels: &[(&str, &str)],
        value: f64,
        kind: MetricKind,
    ) {
        let sample = MetricSample {
            name: name.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            value,
            kind,
        };
        if let Err(e) = self.record(sample) {
            debug!(target: "controller.registry", error = %e, "Metric sample dropped");
        }
    }

    /// Merge static labels into a sample's labels; sample labels win on key
    /// collisions. Result is sorted by key, so series identity is stable.
    fn identity(&self, labels: Vec<(String, String)>) -> Vec<(String, String)> {
        let mut merged: BTreeMap<String, String> = self
            .static_labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (k, v) in labels {
            merged.insert(k, v);
        }
        merged.into_iter().collect()
    }

    fn family(&self, name: &str, kind: MetricKind) -> Result<Arc<Family>, RegistryError> {
        {
            let families = read_unpoisoned(&self.families);
            if let Some(family) = families.get(name) {
                return check_kind(name, family, kind);
            }
        }

        let mut families = write_unpoisoned(&self.families);
        // Re-check: another writer may have created the family between locks.
        if let Some(family) = families.get(name) {
            let family = Arc::clone(family);
            drop(families);
            return check_kind_owned(name, family, kind);
        }
        let family = Arc::new(Family {
            kind,
            bounds: Arc::from(DEFAULT_BUCKETS.as_slice()),
            series: Mutex::new(BTreeMap::new()),
        });
        families.insert(name.to_string(), Arc::clone(&family));
        Ok(family)
    }
}

fn check_kind(name: &str, family: &Arc<Family>, kind: MetricKind) -> Result<Arc<Family>, RegistryError> {
    check_kind_owned(name, Arc::clone(family), kind)
}

fn check_kind_owned(
    name: &str,
    family: Arc<Family>,
    kind: MetricKind,
) -> Result<Arc<Family>, RegistryError> {
    if family.kind == kind {
        Ok(family)
    } else {
        Err(RegistryError::DuplicateSeriesKind {
            metric: name.to_string(),
            registered: family.kind.as_str(),
            requested: kind.as_str(),
        })
    }
}

fn new_accumulator(kind: MetricKind, bounds: &Arc<[f64]>) -> Accumulator {
    match kind {
        MetricKind::Counter => Accumulator::Counter(0.0),
        MetricKind::Gauge => Accumulator::Gauge(0.0),
        MetricKind::Histogram => Accumulator::Histogram {
            counts: vec![0; bounds.len()],
            sum: 0.0,
            count: 0,
        },
    }
}

fn fold(accumulator: &mut Accumulator, value: f64, bounds: &Arc<[f64]>) {
    match accumulator {
        Accumulator::Counter(total) => *total += value,
        Accumulator::Gauge(current) => *current = value,
        Accumulator::Histogram { counts, sum, count } => {
            for (slot, bound) in counts.iter_mut().zip(bounds.iter()) {
                if value <= *bound {
                    *slot += 1;
                }
            }
            *sum += value;
            *count += 1;
        }
    }
}

fn to_value(accumulator: &Accumulator, bounds: &Arc<[f64]>) -> SeriesValue {
    match accumulator {
        Accumulator::Counter(total) => SeriesValue::Counter(*total),
        Accumulator::Gauge(current) => SeriesValue::Gauge(*current),
        Accumulator::Histogram { counts, sum, count } => SeriesValue::Histogram {
            bounds: bounds.to_vec(),
            counts: counts.clone(),
            sum: *sum,
            count: *count,
        },
    }
}

// Lock poisoning can only arise from a panicking writer, which the no-panic
// policy excludes; recover the data rather than propagate the poison.
fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn read_unpoisoned<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn write_unpoisoned<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(std::sync::PoisonError::into_inner)
}
