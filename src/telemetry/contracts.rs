//! Wire types exchanged on `telemetry.metrics` and derived reporting
//! snapshots consumed by the dashboard.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

const MAX_LABEL_KEYS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
    Summary,
}

/// A single observation published onto the bus. `labels` uses a
/// `BTreeMap` so two samples with the same keys/values always compare and
/// hash identically regardless of insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub name: String,
    pub value: f64,
    pub timestamp_ns: i64,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub metric_type: MetricType,
}

impl MetricSample {
    pub fn new(
        name: impl Into<String>,
        value: f64,
        timestamp_ns: i64,
        labels: BTreeMap<String, String>,
        metric_type: MetricType,
    ) -> Result<Self, String> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err("metric name must not be empty".to_string());
        }
        if timestamp_ns < 0 {
            return Err("timestamp_ns must not be negative".to_string());
        }
        if labels.len() > MAX_LABEL_KEYS {
            return Err(format!(
                "metric has {} label keys, maximum is {MAX_LABEL_KEYS}",
                labels.len()
            ));
        }
        Ok(Self {
            name,
            value,
            timestamp_ns,
            labels,
            metric_type,
        })
    }
}

fn unit_range(value: f64, field: &str) -> Result<(), String> {
    if !(0.0..=1.0).contains(&value) {
        return Err(format!("{field} must be within [0, 1], got {value}"));
    }
    Ok(())
}

fn non_negative(value: f64, field: &str) -> Result<(), String> {
    if value < 0.0 {
        return Err(format!("{field} must be non-negative, got {value}"));
    }
    Ok(())
}

/// Per-strategy health snapshot computed on demand for the dashboard; not
/// published on the bus itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyMetrics {
    pub strategy_id: String,
    pub timestamp_ns: i64,
    pub active_positions: u32,
    pub total_pnl: f64,
    pub daily_pnl: f64,
    pub win_rate: f64,
    pub sharpe_ratio: f64,
    pub max_drawdown_pct: f64,
    pub orders_sent: u64,
    pub orders_filled: u64,
    pub orders_rejected: u64,
}

impl StrategyMetrics {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        strategy_id: impl Into<String>,
        timestamp_ns: i64,
        active_positions: u32,
        total_pnl: f64,
        daily_pnl: f64,
        win_rate: f64,
        sharpe_ratio: f64,
        max_drawdown_pct: f64,
        orders_sent: u64,
        orders_filled: u64,
        orders_rejected: u64,
    ) -> Result<Self, String> {
        unit_range(win_rate, "win_rate")?;
        if !(0.0..=100.0).contains(&max_drawdown_pct) {
            return Err(format!(
                "max_drawdown_pct must be within [0, 100], got {max_drawdown_pct}"
            ));
        }
        Ok(Self {
            strategy_id: strategy_id.into(),
            timestamp_ns,
            active_positions,
            total_pnl,
            daily_pnl,
            win_rate,
            sharpe_ratio,
            max_drawdown_pct,
            orders_sent,
            orders_filled,
            orders_rejected,
        })
    }
}

/// Process/bus health snapshot, also computed on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub timestamp_ns: i64,
    pub bus_messages_sent: u64,
    pub bus_messages_received: u64,
    pub journal_writes: u64,
    pub journal_bytes: u64,
    pub active_subscriptions: u32,
    pub event_loop_lag_ms: f64,
    pub memory_usage_mb: f64,
}

impl SystemMetrics {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        timestamp_ns: i64,
        bus_messages_sent: u64,
        bus_messages_received: u64,
        journal_writes: u64,
        journal_bytes: u64,
        active_subscriptions: u32,
        event_loop_lag_ms: f64,
        memory_usage_mb: f64,
    ) -> Result<Self, String> {
        non_negative(event_loop_lag_ms, "event_loop_lag_ms")?;
        non_negative(memory_usage_mb, "memory_usage_mb")?;
        Ok(Self {
            timestamp_ns,
            bus_messages_sent,
            bus_messages_received,
            journal_writes,
            journal_bytes,
            active_subscriptions,
            event_loop_lag_ms,
            memory_usage_mb,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_name() {
        let err = MetricSample::new("", 1.0, 0, BTreeMap::new(), MetricType::Gauge).unwrap_err();
        assert!(err.contains("empty"));
    }

    #[test]
    fn rejects_negative_timestamp() {
        let err =
            MetricSample::new("x", 1.0, -1, BTreeMap::new(), MetricType::Gauge).unwrap_err();
        assert!(err.contains("negative"));
    }

    #[test]
    fn strategy_metrics_rejects_win_rate_out_of_range() {
        let err = StrategyMetrics::new("s1", 0, 0, 0.0, 0.0, 1.5, 0.0, 0.0, 0, 0, 0).unwrap_err();
        assert!(err.contains("win_rate"));
    }

    #[test]
    fn system_metrics_rejects_negative_lag() {
        let err = SystemMetrics::new(0, 0, 0, 0, 0, 0, -1.0, 0.0).unwrap_err();
        assert!(err.contains("event_loop_lag_ms"));
    }

    #[test]
    fn metric_sample_round_trips_through_json() {
        let mut labels = BTreeMap::new();
        labels.insert("strategy_id".to_string(), "s1".to_string());
        let sample = MetricSample::new("orders.count", 3.0, 100, labels, MetricType::Counter).unwrap();
        let encoded = serde_json::to_string(&sample).unwrap();
        let decoded: MetricSample = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, sample);
    }
}
