//! Tiered retention over the aggregated-journal directory: downsample
//! across resolution tiers, gzip-compress aged files, delete expired ones.

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::telemetry::aggregator::downsample_to_interval;
use crate::telemetry::contracts::MetricSample;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionTier {
    pub resolution: String,
    pub retention_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub raw_metrics: Vec<RetentionTier>,
    pub cleanup_schedule: String,
}

impl RetentionPolicy {
    pub fn default_policy() -> Self {
        Self {
            raw_metrics: vec![
                RetentionTier { resolution: "1m".into(), retention_days: 7 },
                RetentionTier { resolution: "5m".into(), retention_days: 30 },
                RetentionTier { resolution: "1h".into(), retention_days: 180 },
                RetentionTier { resolution: "1d".into(), retention_days: 730 },
            ],
            cleanup_schedule: "0 2 * * *".to_string(),
        }
    }

    /// Syntactic-only validation: five space-separated fields of digits,
    /// `*`, `,`, `-`, or `/`. Does not check field ranges or interpret the
    /// schedule; an external scheduler is responsible for acting on it.
    pub fn validate_cron(schedule: &str) -> Result<(), String> {
        let fields: Vec<&str> = schedule.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(format!(
                "cron schedule must have 5 fields, got {}: {schedule:?}",
                fields.len()
            ));
        }
        let is_valid_char = |c: char| c.is_ascii_digit() || matches!(c, '*' | ',' | '-' | '/');
        if fields.iter().any(|f| !f.chars().all(is_valid_char)) {
            return Err(format!("cron schedule has invalid characters: {schedule:?}"));
        }
        Ok(())
    }

    pub fn sorted_tiers(&self) -> Vec<&RetentionTier> {
        let mut tiers: Vec<&RetentionTier> = self.raw_metrics.iter().collect();
        tiers.sort_by_key(|t| t.retention_days);
        tiers
    }

    /// Loads from `<config_root>/base.yaml`'s `retention` key, falling
    /// back to `default_policy()` when the key or file is absent.
    pub fn load(config_root: &Path) -> Self {
        let path = config_root.join("base.yaml");
        let Ok(contents) = std::fs::read_to_string(&path) else {
            return Self::default_policy();
        };
        #[derive(Deserialize)]
        struct Wrapper {
            retention: Option<RetentionPolicy>,
        }
        match serde_yaml::from_str::<Wrapper>(&contents) {
            Ok(Wrapper { retention: Some(policy) }) => policy,
            _ => Self::default_policy(),
        }
    }
}

fn resolution_seconds(resolution: &str) -> Option<u64> {
    match resolution {
        "1m" => Some(60),
        "5m" => Some(300),
        "1h" => Some(3600),
        "1d" => Some(86_400),
        _ => None,
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RetentionStats {
    pub downsampled: u32,
    pub compressed: u32,
    pub deleted: u32,
}

pub struct RetentionEngine {
    journal_dir: PathBuf,
    policy: RetentionPolicy,
}

impl RetentionEngine {
    pub fn new(journal_dir: PathBuf, policy: RetentionPolicy) -> Self {
        Self { journal_dir, policy }
    }

    pub fn apply_retention(&self) -> RetentionStats {
        let mut stats = RetentionStats::default();
        self.downsample_tiers(&mut stats);
        self.compress_aged_files(&mut stats);
        self.delete_expired_files(&mut stats);
        stats
    }

    fn file_age(&self, path: &Path) -> Option<Duration> {
        let metadata = std::fs::metadata(path).ok()?;
        let modified = metadata.modified().ok()?;
        SystemTime::now().duration_since(modified).ok()
    }

    fn downsample_tiers(&self, stats: &mut RetentionStats) {
        let tiers = self.policy.sorted_tiers();
        for pair in tiers.windows(2) {
            let (tier, next_tier) = (pair[0], pair[1]);
            let Some(_) = resolution_seconds(&tier.resolution) else {
                warn!(resolution = %tier.resolution, "unknown resolution label, skipping");
                continue;
            };
            let Some(next_seconds) = resolution_seconds(&next_tier.resolution) else {
                continue;
            };
            let entries = match std::fs::read_dir(&self.journal_dir) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let suffix = format!("_{}.jsonl", tier.resolution);
                let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else { continue };
                if !file_name.ends_with(&suffix) {
                    continue;
                }
                let age = self.file_age(&path).unwrap_or_default();
                if age < Duration::from_secs(tier.retention_days as u64 * 86_400) {
                    continue;
                }
                match self.downsample_file(&path, file_name, &tier.resolution, &next_tier.resolution, next_seconds) {
                    Ok(()) => stats.downsampled += 1,
                    Err(err) => warn!(file = %path.display(), error = %err, "failed to downsample journal file"),
                }
            }
        }
    }

    fn downsample_file(
        &self,
        path: &Path,
        file_name: &str,
        from_resolution: &str,
        to_resolution: &str,
        to_seconds: u64,
    ) -> std::io::Result<()> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut samples = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(record) = serde_json::from_str::<JournalLine>(&line) {
                samples.extend(record.into_samples());
            }
        }
        let downsampled = downsample_to_interval(&samples, to_seconds);
        let out_name = file_name.replacen(&format!("_{from_resolution}.jsonl"), &format!("_{to_resolution}.jsonl"), 1);
        let out_path = self.journal_dir.join(out_name);
        let mut out = std::fs::OpenOptions::new().create(true).append(true).open(out_path)?;
        for sample in downsampled {
            writeln!(out, "{}", serde_json::to_string(&sample).unwrap_or_default())?;
        }
        Ok(())
    }

    fn compress_aged_files(&self, stats: &mut RetentionStats) {
        let Ok(entries) = std::fs::read_dir(&self.journal_dir) else { return };
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else { continue };
            if !file_name.ends_with(".jsonl") {
                continue;
            }
            let age = self.file_age(&path).unwrap_or_default();
            if age < Duration::from_secs(7 * 86_400) {
                continue;
            }
            match self.compress_file(&path) {
                Ok(()) => stats.compressed += 1,
                Err(err) => warn!(file = %path.display(), error = %err, "failed to compress journal file"),
            }
        }
    }

    fn compress_file(&self, path: &Path) -> std::io::Result<()> {
        let data = std::fs::read(path)?;
        let gz_path = path.with_extension("jsonl.gz");
        let out = File::create(&gz_path)?;
        let mut encoder = GzEncoder::new(out, Compression::default());
        encoder.write_all(&data)?;
        encoder.finish()?;
        std::fs::remove_file(path)?;
        Ok(())
    }

    fn delete_expired_files(&self, stats: &mut RetentionStats) {
        let longest_days = self
            .policy
            .raw_metrics
            .iter()
            .map(|t| t.retention_days)
            .max()
            .unwrap_or(0);
        let Ok(entries) = std::fs::read_dir(&self.journal_dir) else { return };
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else { continue };
            if !(file_name.ends_with(".jsonl") || file_name.ends_with(".jsonl.gz")) {
                continue;
            }
            let age = self.file_age(&path).unwrap_or_default();
            if age >= Duration::from_secs(longest_days as u64 * 86_400) {
                if std::fs::remove_file(&path).is_ok() {
                    stats.deleted += 1;
                }
            }
        }
    }
}

#[derive(Deserialize)]
struct JournalLine {
    timestamp_ns: i64,
    metric_name: String,
    metric_type: String,
    #[serde(default)]
    labels: std::collections::BTreeMap<String, String>,
    value: Option<f64>,
    observations: Option<Vec<f64>>,
}

impl JournalLine {
    fn metric_type(&self) -> crate::telemetry::contracts::MetricType {
        use crate::telemetry::contracts::MetricType::*;
        match self.metric_type.as_str() {
            "counter" => Counter,
            "histogram" => Histogram,
            "summary" => Summary,
            _ => Gauge,
        }
    }

    fn into_samples(self) -> Vec<MetricSample> {
        let kind = self.metric_type();
        if let Some(value) = self.value {
            MetricSample::new(self.metric_name, value, self.timestamp_ns, self.labels, kind)
                .into_iter()
                .collect()
        } else if let Some(observations) = self.observations {
            observations
                .into_iter()
                .filter_map(|v| {
                    MetricSample::new(self.metric_name.clone(), v, self.timestamp_ns, self.labels.clone(), kind).ok()
                })
                .collect()
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_matches_known_tiers() {
        let policy = RetentionPolicy::default_policy();
        assert_eq!(policy.raw_metrics.len(), 4);
        assert_eq!(policy.cleanup_schedule, "0 2 * * *");
    }

    #[test]
    fn cron_validation_rejects_wrong_field_count() {
        assert!(RetentionPolicy::validate_cron("0 2 * *").is_err());
        assert!(RetentionPolicy::validate_cron("0 2 * * *").is_ok());
    }

    #[test]
    fn cron_validation_rejects_bad_characters() {
        assert!(RetentionPolicy::validate_cron("0 2 * * mon").is_err());
    }

    #[test]
    fn load_falls_back_to_default_when_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let policy = RetentionPolicy::load(dir.path());
        assert_eq!(policy.raw_metrics.len(), 4);
    }

    #[test]
    fn policy_round_trips_through_yaml() {
        let policy = RetentionPolicy::default_policy();
        let encoded = serde_yaml::to_string(&policy).unwrap();
        let decoded: RetentionPolicy = serde_yaml::from_str(&encoded).unwrap();
        assert_eq!(decoded.cleanup_schedule, policy.cleanup_schedule);
        assert_eq!(decoded.raw_metrics.len(), policy.raw_metrics.len());
    }

    #[test]
    fn apply_retention_leaves_fresh_files_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("metrics_1m.jsonl");
        std::fs::write(&file_path, "{}\n").unwrap();

        let engine = RetentionEngine::new(dir.path().to_path_buf(), RetentionPolicy::default_policy());
        let stats = engine.apply_retention();
        assert_eq!(stats.compressed, 0);
        assert_eq!(stats.deleted, 0);
        assert!(file_path.exists());
    }
}
