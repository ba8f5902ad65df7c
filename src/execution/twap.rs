//! Time-weighted average price: splits the parent quantity into equal
//! slices spread evenly across the configured duration, followed by a
//! matching set of cleanup cancellations at the end of the window.

use std::collections::HashMap;

use serde_json::json;

use crate::execution::base::{generate_execution_id, Executor};
use crate::execution::contracts::{
    AlgoType, ExecutionAlgorithm, ExecutionIntent, FillEvent, OrderType,
};

const DEFAULT_SLICE_COUNT: u32 = 10;

pub struct TwapExecutor {
    pub slice_count: u32,
}

impl Default for TwapExecutor {
    fn default() -> Self {
        Self { slice_count: DEFAULT_SLICE_COUNT }
    }
}

impl TwapExecutor {
    pub fn new(slice_count: u32) -> Self {
        Self { slice_count }
    }
}

impl Executor for TwapExecutor {
    fn algo_type(&self) -> AlgoType {
        AlgoType::Twap
    }

    fn plan_execution(&self, algo: &ExecutionAlgorithm) -> Result<Vec<ExecutionIntent>, String> {
        let limit_price = algo.limit_price()?;
        let execution_id = generate_execution_id(AlgoType::Twap.prefix());
        let n = self.slice_count.max(1);
        let duration_ns = (algo.duration_seconds as i64) * 1_000_000_000;
        let qty = algo.total_quantity / n as f64;

        let mut intents = Vec::with_capacity((n * 2) as usize);
        for i in 0..n {
            let ts = i as i64 * duration_ns / n as i64;
            let slice_id = format!("{execution_id}_slice_{i}");
            let mut meta = HashMap::new();
            meta.insert("execution_id".to_string(), json!(execution_id));
            meta.insert("slice_id".to_string(), json!(slice_id.clone()));
            meta.insert("algo_type".to_string(), json!(AlgoType::Twap.as_str()));
            meta.insert("slice_idx".to_string(), json!(i));
            intents.push(ExecutionIntent {
                id: slice_id.clone(),
                ts_local_ns: ts,
                symbol: algo.symbol.clone(),
                side: algo.side,
                order_type: OrderType::Limit,
                qty,
                limit_price: Some(limit_price),
                meta,
            });
        }

        for i in 0..n {
            let slice_id = format!("{execution_id}_slice_{i}");
            let cancel_id = format!("{slice_id}_cancel");
            let mut meta = HashMap::new();
            meta.insert("execution_id".to_string(), json!(execution_id));
            meta.insert("algo_type".to_string(), json!(AlgoType::Twap.as_str()));
            meta.insert("slice_idx".to_string(), json!(i));
            intents.push(ExecutionIntent::cancel(
                cancel_id,
                duration_ns,
                algo.symbol.clone(),
                algo.side,
                slice_id,
                meta,
            ));
        }

        Ok(intents)
    }
}

/// Aggregates fills into an `ExecutionReport`; a thin wrapper over the
/// shared `summarize_fills` so each algorithm's monitoring task can stay
/// one line.
pub fn monitor_fills(
    execution_id: &str,
    symbol: &str,
    total_quantity: f64,
    slice_count: u32,
    start_ts_ns: i64,
    fills: &[FillEvent],
) -> crate::execution::contracts::ExecutionReport {
    crate::execution::contracts::summarize_fills(
        execution_id,
        symbol,
        total_quantity,
        slice_count,
        start_ts_ns,
        fills,
        None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::contracts::Side;
    use std::collections::HashMap as StdHashMap;

    fn algo_with_limit(total_quantity: f64, duration_seconds: u64, limit_price: f64) -> ExecutionAlgorithm {
        let mut params = StdHashMap::new();
        params.insert("limit_price".to_string(), json!(limit_price));
        ExecutionAlgorithm::new(AlgoType::Twap, "BTC/USDT", Side::Buy, total_quantity, duration_seconds, params)
            .unwrap()
    }

    #[test]
    fn produces_equal_slices_and_matching_cancels() {
        let executor = TwapExecutor::new(5);
        let algo = algo_with_limit(1.0, 300, 50_000.0);
        let intents = executor.plan_execution(&algo).unwrap();

        assert_eq!(intents.len(), 10);
        let active: Vec<_> = intents.iter().filter(|i| i.qty > 0.0).collect();
        assert_eq!(active.len(), 5);
        for intent in &active {
            assert_eq!(intent.qty, 0.2);
            assert_eq!(intent.order_type, OrderType::Limit);
            assert_eq!(intent.limit_price, Some(50_000.0));
        }
        for pair in active.windows(2) {
            assert_eq!(pair[1].ts_local_ns - pair[0].ts_local_ns, 60 * 1_000_000_000);
        }

        let execution_id = active[0].execution_id().unwrap().to_string();
        assert!(active.iter().all(|i| i.execution_id() == Some(execution_id.as_str())));
    }

    #[test]
    fn missing_limit_price_fails_planning() {
        let algo = ExecutionAlgorithm::new(AlgoType::Twap, "BTC/USDT", Side::Buy, 1.0, 300, StdHashMap::new()).unwrap();
        let executor = TwapExecutor::default();
        assert!(executor.plan_execution(&algo).is_err());
    }
}
