//! Participation-of-volume: sizes slices as a target fraction of recently
//! observed market volume, accelerating when actual progress falls behind
//! the time-elapsed schedule.

use std::collections::HashMap;

use serde_json::json;

use crate::bus::Bus;
use crate::execution::base::{generate_execution_id, Executor, FillTracker};
use crate::execution::contracts::{AlgoType, ExecutionAlgorithm, ExecutionIntent, OrderType};

const DEFAULT_MEASUREMENT_PERIOD_SECONDS: u64 = 60;
const LAG_TOLERANCE: f64 = 0.05;
const MAX_ACCELERATION: f64 = 2.0;
const REMAINING_TOLERANCE: f64 = 0.001;

pub struct PovExecutor {
    pub target_pov: f64,
    pub min_volume_threshold: f64,
}

impl Default for PovExecutor {
    fn default() -> Self {
        Self { target_pov: 0.1, min_volume_threshold: 1.0 }
    }
}

impl PovExecutor {
    pub fn new(target_pov: f64, min_volume_threshold: f64) -> Result<Self, String> {
        if !(target_pov > 0.0 && target_pov <= 1.0) {
            return Err(format!("target_pov must be in (0, 1], got {target_pov}"));
        }
        if min_volume_threshold <= 0.0 {
            return Err(format!("min_volume_threshold must be > 0, got {min_volume_threshold}"));
        }
        Ok(Self { target_pov, min_volume_threshold })
    }

    fn measurement_period_seconds(algo: &ExecutionAlgorithm) -> Result<u64, String> {
        match algo.params.get("measurement_period_seconds") {
            None => Ok(DEFAULT_MEASUREMENT_PERIOD_SECONDS),
            Some(v) => {
                let n = v
                    .as_i64()
                    .ok_or_else(|| "measurement_period_seconds must be a number".to_string())?;
                if n <= 0 {
                    return Err("measurement_period_seconds must be > 0".to_string());
                }
                Ok(n as u64)
            }
        }
    }

    /// `base_slice = market_volume · target_pov`, accelerated by up to 2x
    /// when actual progress lags expected progress (driven by elapsed
    /// time against total duration) by more than `LAG_TOLERANCE`, then
    /// clamped to the remaining quantity.
    pub fn calculate_slice_size(
        &self,
        market_volume: f64,
        remaining_quantity: f64,
        time_remaining_ns: i64,
        total_quantity: Option<f64>,
        total_duration_ns: Option<i64>,
    ) -> f64 {
        let mut base_slice = market_volume * self.target_pov;

        if let (Some(total_quantity), Some(total_duration_ns)) = (total_quantity, total_duration_ns) {
            if total_duration_ns > 0 && total_quantity > 0.0 {
                let time_elapsed_ns = total_duration_ns - time_remaining_ns;
                let expected_progress = time_elapsed_ns as f64 / total_duration_ns as f64;
                let actual_progress = (total_quantity - remaining_quantity) / total_quantity;
                if actual_progress < expected_progress - LAG_TOLERANCE {
                    let lag = expected_progress - actual_progress;
                    let acceleration_factor = (1.0 + (lag * 2.0).min(1.0)).min(MAX_ACCELERATION);
                    base_slice *= acceleration_factor;
                }
            }
        }

        base_slice.min(remaining_quantity)
    }

    /// Watches fills and emits the next slice sized against trailing
    /// market volume each time one arrives, until time runs out or the
    /// remaining quantity drops within tolerance of zero.
    pub async fn monitor_and_slice(
        &self,
        bus: &Bus,
        execution_id: String,
        algo: &ExecutionAlgorithm,
        mut recent_volume: impl FnMut(u64) -> f64,
    ) -> Vec<ExecutionIntent> {
        let limit_price = algo.limit_price().unwrap_or_default();
        let period = Self::measurement_period_seconds(algo).unwrap_or(DEFAULT_MEASUREMENT_PERIOD_SECONDS);
        let total_duration_ns = (algo.duration_seconds as i64) * 1_000_000_000;
        let mut tracker = FillTracker::new(bus, execution_id.clone());

        let mut remaining = algo.total_quantity;
        let mut time_remaining_ns = total_duration_ns;
        let mut slice_idx = 1u32;
        let mut slices = Vec::new();

        while remaining > REMAINING_TOLERANCE && time_remaining_ns > 0 {
            let Some(fill) = tracker.next_fill().await else { break };
            remaining -= fill.qty;
            if remaining <= REMAINING_TOLERANCE {
                break;
            }

            let volume = recent_volume(period);
            if volume < self.min_volume_threshold {
                continue;
            }

            let slice_qty = self.calculate_slice_size(
                volume,
                remaining,
                time_remaining_ns,
                Some(algo.total_quantity),
                Some(total_duration_ns),
            );
            if slice_qty <= 0.0 {
                continue;
            }

            let slice_id = format!("{execution_id}_slice_{slice_idx}");
            let mut meta = HashMap::new();
            meta.insert("execution_id".to_string(), json!(execution_id));
            meta.insert("slice_id".to_string(), json!(slice_id.clone()));
            meta.insert("algo_type".to_string(), json!(AlgoType::Pov.as_str()));
            meta.insert("slice_idx".to_string(), json!(slice_idx));
            meta.insert("target_pov".to_string(), json!(self.target_pov));
            slices.push(ExecutionIntent {
                id: slice_id,
                ts_local_ns: total_duration_ns - time_remaining_ns,
                symbol: algo.symbol.clone(),
                side: algo.side,
                order_type: OrderType::Limit,
                qty: slice_qty,
                limit_price: Some(limit_price),
                meta,
            });
            slice_idx += 1;
        }
        slices
    }
}

impl Executor for PovExecutor {
    fn algo_type(&self) -> AlgoType {
        AlgoType::Pov
    }

    fn plan_execution(&self, _algo: &ExecutionAlgorithm) -> Result<Vec<ExecutionIntent>, String> {
        Err("POV planning requires live market volume; use plan_with_volume".to_string())
    }
}

impl PovExecutor {
    /// Pure planning path taking a pre-measured recent volume figure
    /// instead of calling out to a historical-data reader. Returns an
    /// empty plan (not an error) when volume is below threshold — low
    /// volume is an expected operating condition, not a failure.
    pub fn plan_with_volume(
        &self,
        algo: &ExecutionAlgorithm,
        recent_volume: f64,
    ) -> Result<Vec<ExecutionIntent>, String> {
        let limit_price = algo.limit_price()?;
        if recent_volume < self.min_volume_threshold {
            return Ok(Vec::new());
        }
        let execution_id = generate_execution_id(AlgoType::Pov.prefix());
        let qty = (recent_volume * self.target_pov).min(algo.total_quantity);
        let slice_id = format!("{execution_id}_slice_0");
        let mut meta = HashMap::new();
        meta.insert("execution_id".to_string(), json!(execution_id));
        meta.insert("slice_id".to_string(), json!(slice_id.clone()));
        meta.insert("algo_type".to_string(), json!(AlgoType::Pov.as_str()));
        meta.insert("slice_idx".to_string(), json!(0));
        meta.insert("target_pov".to_string(), json!(self.target_pov));
        Ok(vec![ExecutionIntent {
            id: slice_id,
            ts_local_ns: 0,
            symbol: algo.symbol.clone(),
            side: algo.side,
            order_type: OrderType::Limit,
            qty,
            limit_price: Some(limit_price),
            meta,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::contracts::Side;
    use std::collections::HashMap as StdHashMap;

    fn algo(total_quantity: f64, duration_seconds: u64, limit_price: f64) -> ExecutionAlgorithm {
        let mut params = StdHashMap::new();
        params.insert("limit_price".to_string(), json!(limit_price));
        ExecutionAlgorithm::new(AlgoType::Pov, "BTC/USDT", Side::Buy, total_quantity, duration_seconds, params)
            .unwrap()
    }

    #[test]
    fn constructor_validates_target_pov_and_threshold() {
        assert!(PovExecutor::new(0.0, 1.0).is_err());
        assert!(PovExecutor::new(1.5, 1.0).is_err());
        assert!(PovExecutor::new(0.1, 0.0).is_err());
        assert!(PovExecutor::new(0.1, 1.0).is_ok());
    }

    #[test]
    fn low_volume_yields_no_intent_not_an_error() {
        let executor = PovExecutor::new(0.2, 100.0).unwrap();
        let algo = algo(10.0, 300, 100.0);
        let intents = executor.plan_with_volume(&algo, 5.0).unwrap();
        assert!(intents.is_empty());
    }

    #[test]
    fn initial_slice_is_volume_times_target_pov_clamped_to_total() {
        let executor = PovExecutor::new(0.2, 10.0).unwrap();
        let algo = algo(10.0, 300, 100.0);
        let intents = executor.plan_with_volume(&algo, 100.0).unwrap();
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].qty, 10.0); // 100*0.2=20, clamped to total_quantity 10
    }

    #[test]
    fn acceleration_kicks_in_once_lag_exceeds_tolerance() {
        let executor = PovExecutor::new(0.2, 1.0).unwrap();
        let total_duration_ns = 1000 * 1_000_000_000;
        let time_elapsed_ns = 500 * 1_000_000_000;
        let time_remaining_ns = total_duration_ns - time_elapsed_ns;

        // expected_progress = 0.5, actual_progress = 0.3 (30/100 filled) => lag 0.2 > 0.05
        let slice = executor.calculate_slice_size(
            100.0,
            70.0,
            time_remaining_ns,
            Some(100.0),
            Some(total_duration_ns),
        );
        let base = 100.0 * 0.2;
        let expected = base * 1.4;
        assert!((slice - expected).abs() < 1e-6);
    }

    #[test]
    fn no_acceleration_when_on_schedule() {
        let executor = PovExecutor::new(0.2, 1.0).unwrap();
        let total_duration_ns = 1000 * 1_000_000_000;
        let slice = executor.calculate_slice_size(100.0, 50.0, total_duration_ns / 2, Some(100.0), Some(total_duration_ns));
        assert!((slice - 20.0).abs() < 1e-9);
    }
}
