//! In-memory metric registry: counters, gauges, histograms, summaries.
//!
//! Families are keyed by name and created once at registration time.
//! Per-family storage is indexed by an ordered label-value tuple derived
//! from the family's declared `label_names`; presenting a label set whose
//! keys don't exactly match the declared names is a validation error, not
//! a fallback to an "unlabeled" bucket.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

pub type Labels = HashMap<String, String>;

/// Above this many distinct label-value combinations for one metric name, a
/// one-shot warning is logged.
const LABEL_CARDINALITY_WARNING_THRESHOLD: usize = 100;
/// Hard cap on combinations tracked per metric name; the oldest is evicted
/// to make room for a new one past this point, bounding memory under a
/// high-cardinality-label attack.
const LABEL_CARDINALITY_MAX_TRACKED: usize = 128;

/// Per-metric-name record of recently seen label-value combinations, used
/// only to detect and warn about cardinality blowups — it does not gate or
/// reject samples.
#[derive(Default, Debug)]
struct CardinalityTracker {
    seen: Vec<Vec<String>>,
    warned: bool,
}

impl CardinalityTracker {
    /// Records `key`, moving it to the most-recently-seen end if already
    /// tracked, and evicting the oldest entry once `key` is new and the
    /// tracker is at capacity. Returns the number of distinct combinations
    /// currently tracked.
    fn track(&mut self, key: &[String]) -> usize {
        if let Some(pos) = self.seen.iter().position(|k| k == key) {
            let existing = self.seen.remove(pos);
            self.seen.push(existing);
        } else {
            self.seen.push(key.to_vec());
            if self.seen.len() > LABEL_CARDINALITY_MAX_TRACKED {
                self.seen.remove(0);
            }
        }
        self.seen.len()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("{kind} {name} already registered")]
    AlreadyRegistered { kind: &'static str, name: String },
    #[error("metric {0} already registered as a different type")]
    TypeConflict(String),
    #[error("buckets must not be empty")]
    EmptyBuckets,
    #[error("buckets must be sorted, got {0:?}")]
    UnsortedBuckets(Vec<f64>),
    #[error("labels provided but metric {0} declares no label names")]
    UnexpectedLabels(String),
    #[error("metric {0} requires labels {1:?}")]
    MissingLabels(String, Vec<String>),
    #[error("label keys {provided:?} do not match declared names {declared:?} for metric {name}")]
    LabelMismatch {
        name: String,
        provided: Vec<String>,
        declared: Vec<String>,
    },
    #[error("counter {0} cannot be decremented by a negative delta")]
    NegativeDelta(String),
}

fn label_key(label_names: &[String], labels: &Labels) -> Result<Vec<String>, RegistryError> {
    Ok(label_names
        .iter()
        .map(|name| labels.get(name).cloned().unwrap_or_default())
        .collect())
}

fn validate_labels(
    name: &str,
    label_names: &[String],
    labels: &Labels,
) -> Result<Vec<String>, RegistryError> {
    if label_names.is_empty() {
        if !labels.is_empty() {
            return Err(RegistryError::UnexpectedLabels(name.to_string()));
        }
        return Ok(Vec::new());
    }
    if labels.is_empty() {
        return Err(RegistryError::MissingLabels(
            name.to_string(),
            label_names.to_vec(),
        ));
    }
    let mut provided: Vec<String> = labels.keys().cloned().collect();
    provided.sort();
    let mut declared = label_names.to_vec();
    declared.sort();
    if provided != declared {
        return Err(RegistryError::LabelMismatch {
            name: name.to_string(),
            provided,
            declared,
        });
    }
    label_key(label_names, labels)
}

#[derive(Debug)]
struct CounterFamily {
    label_names: Vec<String>,
    help: String,
    values: HashMap<Vec<String>, f64>,
}

#[derive(Debug)]
struct GaugeFamily {
    label_names: Vec<String>,
    help: String,
    values: HashMap<Vec<String>, f64>,
}

#[derive(Debug)]
struct HistogramFamily {
    label_names: Vec<String>,
    help: String,
    buckets: Vec<f64>,
    counts: HashMap<Vec<String>, (Vec<u64>, f64, u64)>,
}

#[derive(Debug)]
struct SummaryFamily {
    label_names: Vec<String>,
    help: String,
    quantiles: Vec<f64>,
    observations: HashMap<Vec<String>, (Vec<f64>, f64, u64)>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Kind {
    Counter,
    Gauge,
    Histogram,
    Summary,
}

#[derive(Default, Debug)]
struct Inner {
    kinds: HashMap<String, Kind>,
    counters: HashMap<String, CounterFamily>,
    gauges: HashMap<String, GaugeFamily>,
    histograms: HashMap<String, HistogramFamily>,
    summaries: HashMap<String, SummaryFamily>,
    cardinality: HashMap<String, CardinalityTracker>,
}

impl Inner {
    /// Tracks one more observation of `key` against `name`'s cardinality
    /// and warns, once, the first time the unique-combination count for
    /// that name crosses the warning threshold. A no-op for unlabeled
    /// metrics (`key` empty), mirroring the upstream contract's "only
    /// track when labels are present" rule.
    fn record_cardinality(&mut self, name: &str, key: &[String]) {
        if key.is_empty() {
            return;
        }
        let tracker = self.cardinality.entry(name.to_string()).or_default();
        let unique_combinations = tracker.track(key);
        if unique_combinations > LABEL_CARDINALITY_WARNING_THRESHOLD && !tracker.warned {
            tracker.warned = true;
            warn!(
                metric_name = name,
                unique_combinations,
                threshold = LABEL_CARDINALITY_WARNING_THRESHOLD,
                "telemetry.metric_cardinality_high"
            );
        }
    }
}

/// Process-wide store shared by the aggregator and the scraper.
#[derive(Clone, Default, Debug)]
pub struct MetricRegistry {
    inner: Arc<Mutex<Inner>>,
}

/// Handle returned by `register_counter`; operations validate labels
/// against the family declared at construction.
#[derive(Clone, Debug)]
pub struct CounterHandle {
    registry: MetricRegistry,
    name: String,
}

#[derive(Clone, Debug)]
pub struct GaugeHandle {
    registry: MetricRegistry,
    name: String,
}

#[derive(Clone, Debug)]
pub struct HistogramHandle {
    registry: MetricRegistry,
    name: String,
}

#[derive(Clone)]
pub struct SummaryHandle {
    registry: MetricRegistry,
    name: String,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_kind_free(
        inner: &Inner,
        name: &str,
        kind: Kind,
        kind_label: &'static str,
    ) -> Result<(), RegistryError> {
        match inner.kinds.get(name) {
            Some(existing) if *existing == kind => Err(RegistryError::AlreadyRegistered {
                kind: kind_label,
                name: name.to_string(),
            }),
            Some(_) => Err(RegistryError::TypeConflict(name.to_string())),
            None => Ok(()),
        }
    }

    pub fn register_counter(
        &self,
        name: impl Into<String>,
        help: impl Into<String>,
        label_names: Vec<String>,
    ) -> Result<CounterHandle, RegistryError> {
        let name = name.into();
        let mut inner = self.inner.lock();
        Self::check_kind_free(&inner, &name, Kind::Counter, "counter")?;
        inner.kinds.insert(name.clone(), Kind::Counter);
        inner.counters.insert(
            name.clone(),
            CounterFamily {
                label_names,
                help: help.into(),
                values: HashMap::new(),
            },
        );
        Ok(CounterHandle {
            registry: self.clone(),
            name,
        })
    }

    pub fn register_gauge(
        &self,
        name: impl Into<String>,
        help: impl Into<String>,
        label_names: Vec<String>,
    ) -> Result<GaugeHandle, RegistryError> {
        let name = name.into();
        let mut inner = self.inner.lock();
        Self::check_kind_free(&inner, &name, Kind::Gauge, "gauge")?;
        inner.kinds.insert(name.clone(), Kind::Gauge);
        inner.gauges.insert(
            name.clone(),
            GaugeFamily {
                label_names,
                help: help.into(),
                values: HashMap::new(),
            },
        );
        Ok(GaugeHandle {
            registry: self.clone(),
            name,
        })
    }

    pub fn register_histogram(
        &self,
        name: impl Into<String>,
        help: impl Into<String>,
        label_names: Vec<String>,
        buckets: Vec<f64>,
    ) -> Result<HistogramHandle, RegistryError> {
        if buckets.is_empty() {
            return Err(RegistryError::EmptyBuckets);
        }
        if !buckets.windows(2).all(|w| w[0] < w[1]) {
            return Err(RegistryError::UnsortedBuckets(buckets));
        }
        let name = name.into();
        let mut inner = self.inner.lock();
        Self::check_kind_free(&inner, &name, Kind::Histogram, "histogram")?;
        inner.kinds.insert(name.clone(), Kind::Histogram);
        inner.histograms.insert(
            name.clone(),
            HistogramFamily {
                label_names,
                help: help.into(),
                buckets,
                counts: HashMap::new(),
            },
        );
        Ok(HistogramHandle {
            registry: self.clone(),
            name,
        })
    }

    pub fn register_summary(
        &self,
        name: impl Into<String>,
        help: impl Into<String>,
        label_names: Vec<String>,
        quantiles: Vec<f64>,
    ) -> Result<SummaryHandle, RegistryError> {
        let name = name.into();
        let mut inner = self.inner.lock();
        Self::check_kind_free(&inner, &name, Kind::Summary, "summary")?;
        inner.kinds.insert(name.clone(), Kind::Summary);
        inner.summaries.insert(
            name.clone(),
            SummaryFamily {
                label_names,
                help: help.into(),
                quantiles,
                observations: HashMap::new(),
            },
        );
        Ok(SummaryHandle {
            registry: self.clone(),
            name,
        })
    }

    pub fn get_counter(&self, name: &str) -> Option<CounterHandle> {
        let inner = self.inner.lock();
        inner.counters.contains_key(name).then(|| CounterHandle {
            registry: self.clone(),
            name: name.to_string(),
        })
    }

    pub fn get_gauge(&self, name: &str) -> Option<GaugeHandle> {
        let inner = self.inner.lock();
        inner.gauges.contains_key(name).then(|| GaugeHandle {
            registry: self.clone(),
            name: name.to_string(),
        })
    }

    pub fn get_histogram(&self, name: &str) -> Option<HistogramHandle> {
        let inner = self.inner.lock();
        inner.histograms.contains_key(name).then(|| HistogramHandle {
            registry: self.clone(),
            name: name.to_string(),
        })
    }

    pub fn get_summary(&self, name: &str) -> Option<SummaryHandle> {
        let inner = self.inner.lock();
        inner.summaries.contains_key(name).then(|| SummaryHandle {
            registry: self.clone(),
            name: name.to_string(),
        })
    }

    /// Snapshot of every family's help text, label names, and current
    /// label-tuple values, used by the scraper's text exposition.
    pub fn collect_all(&self) -> CollectedSnapshot {
        let inner = self.inner.lock();
        CollectedSnapshot {
            counters: inner
                .counters
                .iter()
                .map(|(name, f)| {
                    (
                        name.clone(),
                        CollectedCounter {
                            help: f.help.clone(),
                            label_names: f.label_names.clone(),
                            values: f.values.clone(),
                        },
                    )
                })
                .collect(),
            gauges: inner
                .gauges
                .iter()
                .map(|(name, f)| {
                    (
                        name.clone(),
                        CollectedGauge {
                            help: f.help.clone(),
                            label_names: f.label_names.clone(),
                            values: f.values.clone(),
                        },
                    )
                })
                .collect(),
            histograms: inner
                .histograms
                .iter()
                .map(|(name, f)| {
                    (
                        name.clone(),
                        CollectedHistogram {
                            help: f.help.clone(),
                            label_names: f.label_names.clone(),
                            buckets: f.buckets.clone(),
                            counts: f.counts.clone(),
                        },
                    )
                })
                .collect(),
            summaries: inner
                .summaries
                .iter()
                .map(|(name, f)| {
                    (
                        name.clone(),
                        CollectedSummary {
                            help: f.help.clone(),
                            label_names: f.label_names.clone(),
                            quantiles: f.quantiles.clone(),
                            observations: f.observations.clone(),
                        },
                    )
                })
                .collect(),
        }
    }
}

pub struct CollectedCounter {
    pub help: String,
    pub label_names: Vec<String>,
    pub values: HashMap<Vec<String>, f64>,
}

pub struct CollectedGauge {
    pub help: String,
    pub label_names: Vec<String>,
    pub values: HashMap<Vec<String>, f64>,
}

pub struct CollectedHistogram {
    pub help: String,
    pub label_names: Vec<String>,
    pub buckets: Vec<f64>,
    pub counts: HashMap<Vec<String>, (Vec<u64>, f64, u64)>,
}

pub struct CollectedSummary {
    pub help: String,
    pub label_names: Vec<String>,
    pub quantiles: Vec<f64>,
    pub observations: HashMap<Vec<String>, (Vec<f64>, f64, u64)>,
}

#[derive(Default)]
pub struct CollectedSnapshot {
    pub counters: HashMap<String, CollectedCounter>,
    pub gauges: HashMap<String, CollectedGauge>,
    pub histograms: HashMap<String, CollectedHistogram>,
    pub summaries: HashMap<String, CollectedSummary>,
}

impl CounterHandle {
    pub fn inc(&self, delta: f64, labels: &Labels) -> Result<(), RegistryError> {
        if delta < 0.0 {
            return Err(RegistryError::NegativeDelta(self.name.clone()));
        }
        let mut inner = self.registry.inner.lock();
        let family = inner.counters.get_mut(&self.name).expect("handle outlived family");
        let key = validate_labels(&self.name, &family.label_names, labels)?;
        *family.values.entry(key.clone()).or_insert(0.0) += delta;
        inner.record_cardinality(&self.name, &key);
        Ok(())
    }
}

impl GaugeHandle {
    pub fn set(&self, value: f64, labels: &Labels) -> Result<(), RegistryError> {
        let mut inner = self.registry.inner.lock();
        let family = inner.gauges.get_mut(&self.name).expect("handle outlived family");
        let key = validate_labels(&self.name, &family.label_names, labels)?;
        family.values.insert(key.clone(), value);
        inner.record_cardinality(&self.name, &key);
        Ok(())
    }

    pub fn inc(&self, amount: f64, labels: &Labels) -> Result<(), RegistryError> {
        let mut inner = self.registry.inner.lock();
        let family = inner.gauges.get_mut(&self.name).expect("handle outlived family");
        let key = validate_labels(&self.name, &family.label_names, labels)?;
        *family.values.entry(key.clone()).or_insert(0.0) += amount;
        inner.record_cardinality(&self.name, &key);
        Ok(())
    }

    pub fn dec(&self, amount: f64, labels: &Labels) -> Result<(), RegistryError> {
        let mut inner = self.registry.inner.lock();
        let family = inner.gauges.get_mut(&self.name).expect("handle outlived family");
        let key = validate_labels(&self.name, &family.label_names, labels)?;
        *family.values.entry(key.clone()).or_insert(0.0) -= amount;
        inner.record_cardinality(&self.name, &key);
        Ok(())
    }
}

impl HistogramHandle {
    pub fn observe(&self, value: f64, labels: &Labels) -> Result<(), RegistryError> {
        let mut inner = self.registry.inner.lock();
        let family = inner
            .histograms
            .get_mut(&self.name)
            .expect("handle outlived family");
        let key = validate_labels(&self.name, &family.label_names, labels)?;
        let bucket_count = family.buckets.len();
        let entry = family
            .counts
            .entry(key.clone())
            .or_insert_with(|| (vec![0u64; bucket_count], 0.0, 0));
        for (i, upper_bound) in family.buckets.iter().enumerate() {
            if value <= *upper_bound {
                entry.0[i] += 1;
            }
        }
        entry.1 += value;
        entry.2 += 1;
        inner.record_cardinality(&self.name, &key);
        Ok(())
    }
}

impl SummaryHandle {
    pub fn observe(&self, value: f64, labels: &Labels) -> Result<(), RegistryError> {
        let mut inner = self.registry.inner.lock();
        let family = inner
            .summaries
            .get_mut(&self.name)
            .expect("handle outlived family");
        let key = validate_labels(&self.name, &family.label_names, labels)?;
        let entry = family
            .observations
            .entry(key.clone())
            .or_insert_with(|| (Vec::new(), 0.0, 0));
        entry.0.push(value);
        entry.1 += value;
        entry.2 += 1;
        inner.record_cardinality(&self.name, &key);
        Ok(())
    }
}
