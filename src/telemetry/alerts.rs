//! Threshold alert rules with pending/firing state and a fixed dedup
//! window, evaluated against incoming metric samples.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::bus::Bus;
use crate::telemetry::contracts::MetricSample;

const DEDUP_WINDOW_NS: i64 = 5 * 60 * 1_000_000_000;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AlertRule {
    pub name: String,
    pub metric: String,
    pub condition: String,
    #[serde(default)]
    pub duration: i64,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RulesFile {
    alerts: Vec<AlertRule>,
}

pub fn load_rules(path: &Path) -> Result<Vec<AlertRule>, String> {
    let contents = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let parsed: RulesFile = serde_yaml::from_str(&contents).map_err(|e| e.to_string())?;
    Ok(parsed.alerts)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Pending,
    Firing,
}

struct TrackedAlert {
    state: State,
    current_value: f64,
    active_since_ns: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FiredAlert {
    pub rule_name: String,
    pub metric: String,
    pub value: f64,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub timestamp_ns: i64,
}

fn parse_condition(condition: &str) -> Option<(&str, f64)> {
    let condition = condition.trim();
    for op in ["<=", ">=", "!=", "==", ">", "<", "="] {
        if let Some(rest) = condition.strip_prefix(op) {
            if let Ok(threshold) = rest.trim().parse::<f64>() {
                return Some((op, threshold));
            }
        }
    }
    None
}

fn evaluate(op: &str, value: f64, threshold: f64) -> bool {
    match op {
        ">" => value > threshold,
        ">=" => value >= threshold,
        "<" => value < threshold,
        "<=" => value <= threshold,
        "=" | "==" => value == threshold,
        "!=" => value != threshold,
        _ => false,
    }
}

fn sorted_label_key(rule_name: &str, metric: &str, labels: &std::collections::BTreeMap<String, String>) -> String {
    let mut parts: Vec<String> = labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
    parts.sort();
    format!("{rule_name}:{metric}:{}", parts.join(","))
}

fn render_annotations(
    annotations: &HashMap<String, String>,
    labels: &std::collections::BTreeMap<String, String>,
) -> HashMap<String, String> {
    annotations
        .iter()
        .map(|(k, template)| {
            let mut rendered = template.clone();
            for (label_key, label_value) in labels {
                rendered = rendered.replace(&format!("{{{{ $labels.{label_key} }}}}"), label_value);
            }
            (k.clone(), rendered)
        })
        .collect()
}

/// Owns the pending/firing state tables and the per-rule dedup clock.
/// Not `Sync` by design — a single task drives evaluation.
pub struct AlertEvaluator {
    bus: Bus,
    rules: Vec<AlertRule>,
    active: HashMap<String, TrackedAlert>,
    last_fired_ns: HashMap<String, i64>,
}

impl AlertEvaluator {
    pub fn new(bus: Bus, rules: Vec<AlertRule>) -> Self {
        Self {
            bus,
            rules,
            active: HashMap::new(),
            last_fired_ns: HashMap::new(),
        }
    }

    /// Evaluates every rule whose `metric` matches `sample.name`, mutating
    /// internal state and returning any alerts that were actually
    /// published this call (suppressed-by-dedup alerts are not returned).
    pub fn evaluate_rules(&mut self, sample: &MetricSample) -> Vec<FiredAlert> {
        let mut fired = Vec::new();
        let matching: Vec<AlertRule> = self
            .rules
            .iter()
            .filter(|r| r.metric == sample.name)
            .cloned()
            .collect();

        for rule in matching {
            let Some((op, threshold)) = parse_condition(&rule.condition) else {
                warn!(rule = %rule.name, condition = %rule.condition, "unparseable alert condition");
                continue;
            };
            let condition_true = evaluate(op, sample.value, threshold);
            let key = sorted_label_key(&rule.name, &sample.name, &sample.labels);

            match (self.active.get_mut(&key), condition_true) {
                (None, true) if rule.duration <= 0 => {
                    self.active.insert(
                        key.clone(),
                        TrackedAlert {
                            state: State::Firing,
                            current_value: sample.value,
                            active_since_ns: sample.timestamp_ns,
                        },
                    );
                    if let Some(alert) = self.try_fire(&rule, &sample, sample.timestamp_ns) {
                        fired.push(alert);
                    }
                }
                (None, true) => {
                    self.active.insert(
                        key,
                        TrackedAlert {
                            state: State::Pending,
                            current_value: sample.value,
                            active_since_ns: sample.timestamp_ns,
                        },
                    );
                }
                (Some(tracked), true) => {
                    tracked.current_value = sample.value;
                    let elapsed = sample.timestamp_ns - tracked.active_since_ns;
                    if tracked.state == State::Pending && elapsed >= rule.duration * 1_000_000_000 {
                        tracked.state = State::Firing;
                        if let Some(alert) = self.try_fire(&rule, &sample, sample.timestamp_ns) {
                            fired.push(alert);
                        }
                    } else if tracked.state == State::Firing {
                        if let Some(alert) = self.try_fire(&rule, &sample, sample.timestamp_ns) {
                            fired.push(alert);
                        }
                    }
                }
                (Some(_), false) => {
                    self.active.remove(&key);
                }
                (None, false) => {}
            }
        }
        fired
    }

    fn try_fire(&mut self, rule: &AlertRule, sample: &MetricSample, ts_ns: i64) -> Option<FiredAlert> {
        let dedup_key = format!("{}:{}", rule.name, sample.name);
        if let Some(last) = self.last_fired_ns.get(&dedup_key) {
            if ts_ns - last < DEDUP_WINDOW_NS {
                return None;
            }
        }
        self.last_fired_ns.insert(dedup_key, ts_ns);

        let mut labels = rule.labels.clone();
        for (k, v) in &sample.labels {
            labels.entry(k.clone()).or_insert_with(|| v.clone());
        }
        let alert = FiredAlert {
            rule_name: rule.name.clone(),
            metric: sample.name.clone(),
            value: sample.value,
            labels,
            annotations: render_annotations(&rule.annotations, &sample.labels),
            timestamp_ns: ts_ns,
        };
        self.bus.publish(
            "telemetry.alerts",
            serde_json::to_value(&alert).unwrap_or_default(),
        );
        Some(alert)
    }

    /// Runs the bus-consumer loop, evaluating every incoming sample.
    pub async fn run(&mut self) {
        let mut sub = self.bus.subscribe("telemetry.metrics");
        while let Some(payload) = sub.recv().await {
            match serde_json::from_value::<MetricSample>(payload) {
                Ok(sample) => {
                    let _ = self.evaluate_rules(&sample);
                }
                Err(err) => warn!(error = %err, "dropping malformed sample in alert evaluator"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn sample(name: &str, value: f64, ts_ns: i64) -> MetricSample {
        MetricSample::new(name, value, ts_ns, BTreeMap::new(), crate::telemetry::contracts::MetricType::Gauge).unwrap()
    }

    fn rule(duration: i64) -> AlertRule {
        AlertRule {
            name: "drawdown".into(),
            metric: "njord_drawdown_pct".into(),
            condition: "> 10.0".into(),
            duration,
            labels: [("severity".to_string(), "critical".to_string())].into(),
            annotations: HashMap::new(),
        }
    }

    #[test]
    fn fires_immediately_when_duration_is_zero() {
        let bus = Bus::new();
        let mut evaluator = AlertEvaluator::new(bus, vec![rule(0)]);
        let fired = evaluator.evaluate_rules(&sample("njord_drawdown_pct", 15.0, 1_000_000_000));
        assert_eq!(fired.len(), 1);
    }

    #[test]
    fn pending_then_firing_after_duration_elapses() {
        let bus = Bus::new();
        let mut evaluator = AlertEvaluator::new(bus, vec![rule(60)]);

        let fired = evaluator.evaluate_rules(&sample("njord_drawdown_pct", 15.0, 1_000_000_000));
        assert!(fired.is_empty());

        let fired = evaluator.evaluate_rules(&sample("njord_drawdown_pct", 15.0, 61_000_000_001));
        assert_eq!(fired.len(), 1);
    }

    #[test]
    fn resolves_when_condition_no_longer_holds() {
        let bus = Bus::new();
        let mut evaluator = AlertEvaluator::new(bus, vec![rule(0)]);
        evaluator.evaluate_rules(&sample("njord_drawdown_pct", 15.0, 1_000_000_000));
        assert!(!evaluator.active.is_empty());

        evaluator.evaluate_rules(&sample("njord_drawdown_pct", 5.0, 2_000_000_000));
        assert!(evaluator.active.is_empty());
    }

    #[test]
    fn dedup_window_suppresses_repeat_emission() {
        let bus = Bus::new();
        let mut evaluator = AlertEvaluator::new(bus, vec![rule(0)]);
        let first = evaluator.evaluate_rules(&sample("njord_drawdown_pct", 15.0, 1_000_000_000));
        assert_eq!(first.len(), 1);

        let second = evaluator.evaluate_rules(&sample("njord_drawdown_pct", 16.0, 2_000_000_000));
        assert!(second.is_empty());
    }

    #[test]
    fn load_rules_rejects_missing_required_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.yaml");
        std::fs::write(&path, "alerts:\n  - name: foo\n").unwrap();
        assert!(load_rules(&path).is_err());
    }

    #[test]
    fn load_rules_parses_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.yaml");
        std::fs::write(
            &path,
            "alerts:\n  - name: foo\n    metric: bar\n    condition: \"> 1.0\"\n",
        )
        .unwrap();
        let rules = load_rules(&path).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].name, "foo");
    }
}
