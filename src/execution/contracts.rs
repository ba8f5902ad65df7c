//! Wire types shared by every execution algorithm: the parent
//! configuration, the child intents they emit, and the fills/reports that
//! correlate back through the bus.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgoType {
    Twap,
    Vwap,
    Iceberg,
    Pov,
}

impl AlgoType {
    pub fn prefix(self) -> &'static str {
        match self {
            AlgoType::Twap => "twap",
            AlgoType::Vwap => "vwap",
            AlgoType::Iceberg => "iceberg",
            AlgoType::Pov => "pov",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AlgoType::Twap => "TWAP",
            AlgoType::Vwap => "VWAP",
            AlgoType::Iceberg => "Iceberg",
            AlgoType::Pov => "POV",
        }
    }
}

/// Immutable parent-order configuration handed to an executor's
/// `plan_execution`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionAlgorithm {
    pub algo_type: AlgoType,
    pub symbol: String,
    pub side: Side,
    pub total_quantity: f64,
    pub duration_seconds: u64,
    #[serde(default)]
    pub params: HashMap<String, Value>,
}

impl ExecutionAlgorithm {
    pub fn new(
        algo_type: AlgoType,
        symbol: impl Into<String>,
        side: Side,
        total_quantity: f64,
        duration_seconds: u64,
        params: HashMap<String, Value>,
    ) -> Result<Self, String> {
        if total_quantity <= 0.0 {
            return Err(format!("total_quantity must be > 0, got {total_quantity}"));
        }
        if duration_seconds == 0 {
            return Err("duration_seconds must be > 0".to_string());
        }
        Ok(Self {
            algo_type,
            symbol: symbol.into(),
            side,
            total_quantity,
            duration_seconds,
            params,
        })
    }

    /// Required, positive, numeric `limit_price` from `params`. Shared by
    /// every algorithm that emits limit child orders.
    pub fn limit_price(&self) -> Result<f64, String> {
        let value = self
            .params
            .get("limit_price")
            .ok_or_else(|| "limit_price must be provided".to_string())?;
        let price = value
            .as_f64()
            .ok_or_else(|| "limit_price must be a number".to_string())?;
        if price <= 0.0 {
            return Err("limit_price must be > 0".to_string());
        }
        Ok(price)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Limit,
    Market,
}

/// A child order. `meta` carries the correlation fabric (`execution_id`,
/// `slice_id`, `algo_type`, `slice_idx`, plus algorithm-specific extras)
/// that fills are required to echo back verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionIntent {
    pub id: String,
    pub ts_local_ns: i64,
    pub symbol: String,
    pub side: Side,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub qty: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<f64>,
    pub meta: HashMap<String, Value>,
}

impl ExecutionIntent {
    pub fn execution_id(&self) -> Option<&str> {
        self.meta.get("execution_id").and_then(|v| v.as_str())
    }

    pub fn slice_idx(&self) -> Option<u64> {
        self.meta.get("slice_idx").and_then(|v| v.as_u64())
    }

    pub fn cancel(id: String, ts_local_ns: i64, symbol: String, side: Side, target_slice_id: String, mut meta: HashMap<String, Value>) -> Self {
        meta.insert("action".to_string(), Value::String("cancel".to_string()));
        meta.insert("target_slice_id".to_string(), Value::String(target_slice_id));
        Self {
            id,
            ts_local_ns,
            symbol,
            side,
            order_type: OrderType::Limit,
            qty: 0.0,
            limit_price: None,
            meta,
        }
    }
}

/// A fill against one child intent. `meta` is copied verbatim from the
/// originating intent by the broker — it is the only correlation channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillEvent {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub price: f64,
    pub ts_fill_ns: i64,
    #[serde(default)]
    pub fee: f64,
    pub meta: HashMap<String, Value>,
}

impl FillEvent {
    pub fn execution_id(&self) -> Option<&str> {
        self.meta.get("execution_id").and_then(|v| v.as_str())
    }

    pub fn slice_idx(&self) -> Option<u64> {
        self.meta.get("slice_idx").and_then(|v| v.as_u64())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub execution_id: String,
    pub symbol: String,
    pub total_quantity: f64,
    pub filled_quantity: f64,
    pub remaining_quantity: f64,
    pub avg_fill_price: f64,
    pub total_fees: f64,
    pub slices_completed: u32,
    pub slices_total: u32,
    pub status: ExecutionStatus,
    pub start_ts_ns: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_ts_ns: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub benchmark_vwap: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vwap_deviation: Option<f64>,
}

/// Builds an `ExecutionReport` from a set of fills sharing one
/// `execution_id`. Shared by every executor's fill-monitoring path and by
/// the backtest simulator.
pub fn summarize_fills(
    execution_id: &str,
    symbol: &str,
    total_quantity: f64,
    slices_total: u32,
    start_ts_ns: i64,
    fills: &[FillEvent],
    benchmark_vwap: Option<f64>,
) -> ExecutionReport {
    let filled_quantity: f64 = fills.iter().map(|f| f.qty).sum();
    let total_cost: f64 = fills.iter().map(|f| f.qty * f.price).sum();
    let total_fees: f64 = fills.iter().map(|f| f.fee).sum();
    let avg_fill_price = if filled_quantity > 0.0 { total_cost / filled_quantity } else { 0.0 };
    let status = if fills.is_empty() {
        ExecutionStatus::Failed
    } else if filled_quantity >= total_quantity {
        ExecutionStatus::Completed
    } else {
        ExecutionStatus::Running
    };
    let vwap_deviation = match (benchmark_vwap, avg_fill_price) {
        (Some(bench), avg) if bench != 0.0 && filled_quantity > 0.0 => Some((avg - bench) / bench),
        _ => None,
    };
    ExecutionReport {
        execution_id: execution_id.to_string(),
        symbol: symbol.to_string(),
        total_quantity,
        filled_quantity,
        remaining_quantity: (total_quantity - filled_quantity).max(0.0),
        avg_fill_price,
        total_fees,
        slices_completed: fills
            .iter()
            .filter_map(|f| f.slice_idx())
            .collect::<std::collections::HashSet<_>>()
            .len() as u32,
        slices_total,
        status,
        start_ts_ns,
        end_ts_ns: matches!(status, ExecutionStatus::Completed).then_some(start_ts_ns),
        benchmark_vwap,
        vwap_deviation,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_price_validation_matches_missing_type_and_range_cases() {
        let algo = ExecutionAlgorithm::new(AlgoType::Twap, "BTC/USDT", Side::Buy, 1.0, 300, HashMap::new()).unwrap();
        assert!(algo.limit_price().unwrap_err().contains("must be provided"));

        let mut params = HashMap::new();
        params.insert("limit_price".to_string(), Value::String("x".to_string()));
        let algo = ExecutionAlgorithm::new(AlgoType::Twap, "BTC/USDT", Side::Buy, 1.0, 300, params).unwrap();
        assert!(algo.limit_price().unwrap_err().contains("must be a number"));

        let mut params = HashMap::new();
        params.insert("limit_price".to_string(), Value::from(-1.0));
        let algo = ExecutionAlgorithm::new(AlgoType::Twap, "BTC/USDT", Side::Buy, 1.0, 300, params).unwrap();
        assert!(algo.limit_price().unwrap_err().contains("must be > 0"));
    }

    #[test]
    fn summarize_fills_marks_completed_once_total_is_reached() {
        let fills = vec![FillEvent {
            order_id: "1".into(),
            symbol: "BTC/USDT".into(),
            side: Side::Buy,
            qty: 1.0,
            price: 100.0,
            ts_fill_ns: 0,
            fee: 0.1,
            meta: HashMap::new(),
        }];
        let report = summarize_fills("exec_1", "BTC/USDT", 1.0, 1, 0, &fills, None);
        assert_eq!(report.status, ExecutionStatus::Completed);
        assert_eq!(report.avg_fill_price, 100.0);
    }

    #[test]
    fn summarize_fills_marks_failed_when_empty() {
        let report = summarize_fills("exec_1", "BTC/USDT", 1.0, 1, 0, &[], None);
        assert_eq!(report.status, ExecutionStatus::Failed);
    }

    #[test]
    fn execution_algorithm_round_trips_through_json() {
        let mut params = HashMap::new();
        params.insert("limit_price".to_string(), Value::from(50_000.0));
        let algo = ExecutionAlgorithm::new(AlgoType::Twap, "BTC/USDT", Side::Buy, 1.0, 300, params).unwrap();
        let encoded = serde_json::to_string(&algo).unwrap();
        let decoded: ExecutionAlgorithm = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.symbol, algo.symbol);
        assert_eq!(decoded.total_quantity, algo.total_quantity);
        assert_eq!(decoded.limit_price().unwrap(), algo.limit_price().unwrap());
    }

    #[test]
    fn execution_intent_round_trips_through_json() {
        let mut meta = HashMap::new();
        meta.insert("execution_id".to_string(), Value::String("exec_1".to_string()));
        let intent = ExecutionIntent {
            id: "slice_0".into(),
            ts_local_ns: 42,
            symbol: "BTC/USDT".into(),
            side: Side::Sell,
            order_type: OrderType::Limit,
            qty: 2.5,
            limit_price: Some(101.5),
            meta,
        };
        let encoded = serde_json::to_string(&intent).unwrap();
        let decoded: ExecutionIntent = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.id, intent.id);
        assert_eq!(decoded.side, intent.side);
        assert_eq!(decoded.limit_price, intent.limit_price);
        assert_eq!(decoded.meta, intent.meta);
    }

    #[test]
    fn execution_report_round_trips_through_json() {
        let report = summarize_fills("exec_1", "BTC/USDT", 1.0, 1, 0, &[], None);
        let encoded = serde_json::to_string(&report).unwrap();
        let decoded: ExecutionReport = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.execution_id, report.execution_id);
        assert_eq!(decoded.status, report.status);
        assert_eq!(decoded.end_ts_ns, report.end_ts_ns);
    }
}
