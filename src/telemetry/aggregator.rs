//! Time-bucketed accumulation of samples published on `telemetry.metrics`,
//! periodically flushed into the shared registry and journaled to disk.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::bus::Bus;
use crate::telemetry::contracts::{MetricSample, MetricType};
use crate::telemetry::registry::{Labels, MetricRegistry};

fn now_ns() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

#[derive(Default)]
struct Bucket {
    start_ts_ns: i64,
    interval_seconds: u64,
    counters: HashMap<(String, Vec<(String, String)>), f64>,
    gauges: HashMap<(String, Vec<(String, String)>), (f64, u64)>,
    histograms: HashMap<(String, Vec<(String, String)>), Vec<f64>>,
}

impl Bucket {
    fn new(start_ts_ns: i64, interval_seconds: u64) -> Self {
        Self {
            start_ts_ns,
            interval_seconds,
            ..Default::default()
        }
    }

    fn end_ts_ns(&self) -> i64 {
        self.start_ts_ns + (self.interval_seconds as i64) * 1_000_000_000
    }

    fn contains(&self, ts_ns: i64) -> bool {
        ts_ns >= self.start_ts_ns && ts_ns < self.end_ts_ns()
    }
}

fn sorted_label_pairs(labels: &std::collections::BTreeMap<String, String>) -> Vec<(String, String)> {
    labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

fn to_labels(pairs: &[(String, String)]) -> Labels {
    pairs.iter().cloned().collect()
}

/// Subscribes to `telemetry.metrics`, accumulates into interval-aligned
/// buckets, and flushes buckets to the registry + journal once they have
/// aged past the configured grace period.
pub struct MetricAggregator {
    bus: Bus,
    registry: MetricRegistry,
    journal_dir: PathBuf,
    interval_seconds: u64,
    retention_hours: u64,
    flush_interval_seconds: u64,
    grace_period_seconds: u64,
    buckets: Arc<Mutex<HashMap<i64, Bucket>>>,
}

#[derive(Serialize)]
struct JournalRecord<'a> {
    timestamp_ns: i64,
    metric_name: &'a str,
    metric_type: &'a str,
    labels: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    observations: Option<Vec<f64>>,
    interval_seconds: u64,
}

impl MetricAggregator {
    pub fn new(
        bus: Bus,
        registry: MetricRegistry,
        journal_dir: PathBuf,
        retention_hours: u64,
        flush_interval_seconds: u64,
        grace_period_seconds: u64,
    ) -> Self {
        Self {
            bus,
            registry,
            journal_dir,
            interval_seconds: 60,
            retention_hours,
            flush_interval_seconds,
            grace_period_seconds,
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn bucket_key(&self, ts_ns: i64) -> i64 {
        let interval_ns = (self.interval_seconds as i64) * 1_000_000_000;
        (ts_ns / interval_ns) * interval_ns
    }

    /// Places one sample into its time bucket. Pure accumulation, no I/O.
    pub fn absorb(&self, sample: &MetricSample) {
        let key = self.bucket_key(sample.timestamp_ns);
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry(key)
            .or_insert_with(|| Bucket::new(key, self.interval_seconds));
        if !bucket.contains(sample.timestamp_ns) {
            warn!(metric = %sample.name, "sample timestamp outside its own bucket window, absorbing anyway");
        }
        let label_pairs = sorted_label_pairs(&sample.labels);
        let id = (sample.name.clone(), label_pairs);
        match sample.metric_type {
            MetricType::Counter => {
                *bucket.counters.entry(id).or_insert(0.0) += sample.value;
            }
            MetricType::Gauge => {
                let entry = bucket.gauges.entry(id).or_insert((0.0, 0));
                entry.0 += sample.value;
                entry.1 += 1;
            }
            MetricType::Histogram | MetricType::Summary => {
                bucket.histograms.entry(id).or_default().push(sample.value);
            }
        }
    }

    /// Runs the bus-consumer loop and the periodic flush/evict timer
    /// concurrently until the bus is closed.
    pub async fn run(&self) {
        let mut sub = self.bus.subscribe("telemetry.metrics");
        let mut flush_timer = tokio::time::interval(Duration::from_secs(self.flush_interval_seconds));

        loop {
            tokio::select! {
                maybe_msg = sub.recv() => {
                    match maybe_msg {
                        Some(payload) => self.handle_message(payload),
                        None => break,
                    }
                }
                _ = flush_timer.tick() => {
                    self.flush_ready_buckets();
                    self.evict_expired_buckets();
                }
            }
        }
    }

    fn handle_message(&self, payload: serde_json::Value) {
        match serde_json::from_value::<MetricSample>(payload) {
            Ok(sample) => self.absorb(&sample),
            Err(err) => warn!(error = %err, "dropping malformed metric sample"),
        }
    }

    fn flush_ready_buckets(&self) {
        let grace_ns = (self.grace_period_seconds as i64) * 1_000_000_000;
        let now = now_ns();
        let ready_keys: Vec<i64> = {
            let buckets = self.buckets.lock();
            buckets
                .values()
                .filter(|b| b.end_ts_ns() < now - grace_ns)
                .map(|b| b.start_ts_ns)
                .collect()
        };
        for key in ready_keys {
            let bucket = {
                let mut buckets = self.buckets.lock();
                buckets.remove(&key)
            };
            if let Some(bucket) = bucket {
                self.flush_bucket(bucket);
            }
        }
    }

    fn flush_bucket(&self, bucket: Bucket) {
        let mut records = Vec::new();

        for ((name, label_pairs), value) in &bucket.counters {
            let declared: Vec<String> = label_pairs.iter().map(|(k, _)| k.clone()).collect();
            if self.registry.get_counter(name).is_none() {
                let _ = self.registry.register_counter(
                    name.clone(),
                    format!("auto-registered counter {name}"),
                    declared,
                );
            }
            if let Some(handle) = self.registry.get_counter(name) {
                if let Err(err) = handle.inc(*value, &to_labels(label_pairs)) {
                    warn!(metric = %name, error = %err, "failed to flush counter into registry");
                }
            }
            records.push(JournalRecord {
                timestamp_ns: bucket.start_ts_ns,
                metric_name: name,
                metric_type: "counter",
                labels: to_labels(label_pairs),
                value: Some(*value),
                observations: None,
                interval_seconds: bucket.interval_seconds,
            });
        }

        for ((name, label_pairs), (sum, count)) in &bucket.gauges {
            let avg = if *count > 0 { sum / (*count as f64) } else { 0.0 };
            let declared: Vec<String> = label_pairs.iter().map(|(k, _)| k.clone()).collect();
            if self.registry.get_gauge(name).is_none() {
                let _ = self.registry.register_gauge(
                    name.clone(),
                    format!("auto-registered gauge {name}"),
                    declared,
                );
            }
            if let Some(handle) = self.registry.get_gauge(name) {
                if let Err(err) = handle.set(avg, &to_labels(label_pairs)) {
                    warn!(metric = %name, error = %err, "failed to flush gauge into registry");
                }
            }
            records.push(JournalRecord {
                timestamp_ns: bucket.start_ts_ns,
                metric_name: name,
                metric_type: "gauge",
                labels: to_labels(label_pairs),
                value: Some(avg),
                observations: None,
                interval_seconds: bucket.interval_seconds,
            });
        }

        for ((name, label_pairs), observations) in &bucket.histograms {
            if let Some(handle) = self.registry.get_histogram(name) {
                for value in observations {
                    if let Err(err) = handle.observe(*value, &to_labels(label_pairs)) {
                        warn!(metric = %name, error = %err, "failed to flush histogram observation");
                    }
                }
            } else {
                debug!(metric = %name, "no histogram family registered, skipping registry replay");
            }
            records.push(JournalRecord {
                timestamp_ns: bucket.start_ts_ns,
                metric_name: name,
                metric_type: "histogram",
                labels: to_labels(label_pairs),
                value: None,
                observations: Some(observations.clone()),
                interval_seconds: bucket.interval_seconds,
            });
        }

        if let Err(err) = self.write_journal(&records) {
            warn!(error = %err, "failed to write aggregated metrics journal");
        }
    }

    fn write_journal(&self, records: &[JournalRecord]) -> std::io::Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.journal_dir)?;
        let path = self.journal_dir.join("aggregated_metrics.ndjson");
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        for record in records {
            writeln!(file, "{}", serde_json::to_string(record)?)?;
        }
        Ok(())
    }

    /// Drops buckets older than `retention_hours + grace_period`
    /// regardless of whether they were ever flushed. This runs on every
    /// tick, independent of the flush path — intentional, matching the
    /// source behaviour it was ported from.
    fn evict_expired_buckets(&self) {
        let horizon_ns = (self.retention_hours as i64) * 3_600 * 1_000_000_000
            + (self.grace_period_seconds as i64) * 1_000_000_000;
        let now = now_ns();
        let mut buckets = self.buckets.lock();
        buckets.retain(|_, b| b.end_ts_ns() >= now - horizon_ns);
    }
}

/// Pure re-bucketing helper used both by the aggregator's own bucketing
/// and by the retention engine's downsample pass.
pub fn downsample_to_interval(
    samples: &[MetricSample],
    interval_seconds: u64,
) -> Vec<MetricSample> {
    let interval_ns = (interval_seconds as i64) * 1_000_000_000;
    let mut counters: HashMap<(String, Vec<(String, String)>, i64), f64> = HashMap::new();
    let mut gauges: HashMap<(String, Vec<(String, String)>, i64), (f64, u64)> = HashMap::new();
    let mut histograms: HashMap<(String, Vec<(String, String)>, i64), Vec<f64>> = HashMap::new();
    let mut kinds: HashMap<(String, Vec<(String, String)>, i64), MetricType> = HashMap::new();

    for sample in samples {
        let bucket_start = (sample.timestamp_ns / interval_ns) * interval_ns;
        let pairs = sorted_label_pairs(&sample.labels);
        let id = (sample.name.clone(), pairs, bucket_start);
        kinds.insert(id.clone(), sample.metric_type);
        match sample.metric_type {
            MetricType::Counter => *counters.entry(id).or_insert(0.0) += sample.value,
            MetricType::Gauge => {
                let entry = gauges.entry(id).or_insert((0.0, 0));
                entry.0 += sample.value;
                entry.1 += 1;
            }
            MetricType::Histogram | MetricType::Summary => {
                histograms.entry(id).or_default().push(sample.value);
            }
        }
    }

    let mut out = Vec::new();
    for (id, kind) in kinds {
        let (name, pairs, bucket_start) = id.clone();
        let labels: std::collections::BTreeMap<String, String> = pairs.into_iter().collect();
        match kind {
            MetricType::Counter => {
                if let Some(v) = counters.get(&id) {
                    if let Ok(s) = MetricSample::new(name, *v, bucket_start, labels, kind) {
                        out.push(s);
                    }
                }
            }
            MetricType::Gauge => {
                if let Some((sum, count)) = gauges.get(&id) {
                    let avg = if *count > 0 { sum / (*count as f64) } else { 0.0 };
                    if let Ok(s) = MetricSample::new(name, avg, bucket_start, labels, kind) {
                        out.push(s);
                    }
                }
            }
            MetricType::Histogram | MetricType::Summary => {
                if let Some(values) = histograms.get(&id) {
                    for v in values {
                        if let Ok(s) = MetricSample::new(name.clone(), *v, bucket_start, labels.clone(), kind) {
                            out.push(s);
                        }
                    }
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn sample(name: &str, value: f64, ts_ns: i64, kind: MetricType) -> MetricSample {
        MetricSample::new(name, value, ts_ns, BTreeMap::new(), kind).unwrap()
    }

    #[tokio::test]
    async fn flush_sums_counters_in_one_bucket() {
        let registry = MetricRegistry::new();
        let bus = Bus::new();
        let dir = tempfile::tempdir().unwrap();
        let agg = MetricAggregator::new(
            bus,
            registry.clone(),
            dir.path().to_path_buf(),
            168,
            60,
            0,
        );

        agg.absorb(&sample("requests_total", 10.0, 1_000_000_000, MetricType::Counter));
        agg.absorb(&sample("requests_total", 15.0, 1_030_000_000_000, MetricType::Counter));

        agg.flush_ready_buckets();

        let snap = registry.collect_all();
        let counter = &snap.counters["requests_total"];
        assert_eq!(counter.values[&Vec::<String>::new()], 25.0);

        let journal = std::fs::read_to_string(dir.path().join("aggregated_metrics.ndjson")).unwrap();
        assert!(journal.contains("\"value\":25.0"));
        assert!(journal.contains("\"interval_seconds\":60"));
    }

    #[test]
    fn eviction_drops_old_buckets_even_if_unflushed() {
        let registry = MetricRegistry::new();
        let bus = Bus::new();
        let dir = tempfile::tempdir().unwrap();
        let agg = MetricAggregator::new(bus, registry, dir.path().to_path_buf(), 0, 60, 0);

        agg.absorb(&sample("g", 1.0, 0, MetricType::Gauge));
        assert_eq!(agg.buckets.lock().len(), 1);

        agg.evict_expired_buckets();
        assert_eq!(agg.buckets.lock().len(), 0);
    }

    #[test]
    fn downsample_averages_gauges_and_sums_counters() {
        let samples = vec![
            sample("g", 2.0, 0, MetricType::Gauge),
            sample("g", 4.0, 1_000_000_000, MetricType::Gauge),
            sample("c", 1.0, 0, MetricType::Counter),
            sample("c", 1.0, 1_000_000_000, MetricType::Counter),
        ];
        let out = downsample_to_interval(&samples, 3600);
        let gauge = out.iter().find(|s| s.name == "g").unwrap();
        assert_eq!(gauge.value, 3.0);
        let counter = out.iter().find(|s| s.name == "c").unwrap();
        assert_eq!(counter.value, 2.0);
    }
}
