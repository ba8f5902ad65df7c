//! Iceberg: shows only a fraction of the parent quantity at a time,
//! replenishing the visible slice as it fills.

use std::collections::HashMap;

use serde_json::json;

use crate::bus::Bus;
use crate::execution::base::{generate_execution_id, Executor, FillTracker};
use crate::execution::contracts::{AlgoType, ExecutionAlgorithm, ExecutionIntent, OrderType};

pub struct IcebergExecutor {
    pub visible_ratio: f64,
    pub replenish_threshold: f64,
}

impl Default for IcebergExecutor {
    fn default() -> Self {
        Self { visible_ratio: 0.1, replenish_threshold: 0.5 }
    }
}

impl IcebergExecutor {
    pub fn new(visible_ratio: f64, replenish_threshold: f64) -> Result<Self, String> {
        if !(visible_ratio > 0.0 && visible_ratio <= 1.0) {
            return Err(format!("visible_ratio must be in (0, 1], got {visible_ratio}"));
        }
        if !(replenish_threshold > 0.0 && replenish_threshold <= 1.0) {
            return Err(format!(
                "replenish_threshold must be in (0, 1], got {replenish_threshold}"
            ));
        }
        Ok(Self { visible_ratio, replenish_threshold })
    }

    fn build_intent(
        &self,
        execution_id: &str,
        slice_idx: u32,
        qty: f64,
        total_quantity: f64,
        limit_price: f64,
        symbol: &str,
        side: crate::execution::contracts::Side,
    ) -> ExecutionIntent {
        let slice_id = format!("{execution_id}_slice_{slice_idx}");
        let mut meta = HashMap::new();
        meta.insert("execution_id".to_string(), json!(execution_id));
        meta.insert("slice_id".to_string(), json!(slice_id.clone()));
        meta.insert("algo_type".to_string(), json!(AlgoType::Iceberg.as_str()));
        meta.insert("slice_idx".to_string(), json!(slice_idx));
        meta.insert("total_quantity".to_string(), json!(total_quantity));
        meta.insert("visible_ratio".to_string(), json!(self.visible_ratio));
        meta.insert("replenish_threshold".to_string(), json!(self.replenish_threshold));
        ExecutionIntent {
            id: slice_id,
            ts_local_ns: 0,
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Limit,
            qty,
            limit_price: Some(limit_price),
            meta,
        }
    }

    /// Watches fills for the current visible slice and yields the next
    /// replenishment intent once `replenish_threshold · visible_qty` has
    /// filled. Stops once `total_quantity` has been fully filled; the
    /// final replenishment is sized to whatever remains even if that's
    /// smaller than a full visible slice.
    pub async fn monitor_and_replenish(
        &self,
        bus: &Bus,
        execution_id: String,
        algo: &ExecutionAlgorithm,
    ) -> Vec<ExecutionIntent> {
        let limit_price = algo.limit_price().unwrap_or_default();
        let visible_qty = algo.total_quantity * self.visible_ratio;
        let mut tracker = FillTracker::new(bus, execution_id.clone());

        let mut total_filled = 0.0;
        let mut current_slice_filled = 0.0;
        let mut next_slice_idx = 1;
        let mut replenishments = Vec::new();

        while total_filled < algo.total_quantity {
            let Some(fill) = tracker.next_fill().await else { break };
            total_filled += fill.qty;
            current_slice_filled += fill.qty;

            if current_slice_filled >= self.replenish_threshold * visible_qty {
                let remaining_total = algo.total_quantity - total_filled;
                if remaining_total <= 0.0 {
                    break;
                }
                let next_qty = visible_qty.min(remaining_total);
                replenishments.push(self.build_intent(
                    &execution_id,
                    next_slice_idx,
                    next_qty,
                    algo.total_quantity,
                    limit_price,
                    &algo.symbol,
                    algo.side,
                ));
                next_slice_idx += 1;
                current_slice_filled = 0.0;
            }
        }
        replenishments
    }
}

impl Executor for IcebergExecutor {
    fn algo_type(&self) -> AlgoType {
        AlgoType::Iceberg
    }

    fn plan_execution(&self, algo: &ExecutionAlgorithm) -> Result<Vec<ExecutionIntent>, String> {
        let limit_price = algo.limit_price()?;
        let execution_id = generate_execution_id(AlgoType::Iceberg.prefix());
        let visible_qty = algo.total_quantity * self.visible_ratio;
        Ok(vec![self.build_intent(
            &execution_id,
            0,
            visible_qty,
            algo.total_quantity,
            limit_price,
            &algo.symbol,
            algo.side,
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::contracts::{FillEvent, Side};
    use std::collections::HashMap as StdHashMap;

    fn algo(total_quantity: f64, limit_price: f64) -> ExecutionAlgorithm {
        let mut params = StdHashMap::new();
        params.insert("limit_price".to_string(), json!(limit_price));
        ExecutionAlgorithm::new(AlgoType::Iceberg, "BTC/USDT", Side::Buy, total_quantity, 600, params).unwrap()
    }

    #[test]
    fn constructor_validates_ratio_ranges() {
        assert!(IcebergExecutor::new(0.0, 0.5).is_err());
        assert!(IcebergExecutor::new(1.1, 0.5).is_err());
        assert!(IcebergExecutor::new(0.1, 0.0).is_err());
        assert!(IcebergExecutor::new(0.1, 1.5).is_err());
        assert!(IcebergExecutor::new(0.1, 0.5).is_ok());
    }

    #[test]
    fn plan_execution_shows_only_the_visible_fraction() {
        let executor = IcebergExecutor::new(0.2, 0.5).unwrap();
        let algo = algo(10.0, 100.0);
        let intents = executor.plan_execution(&algo).unwrap();
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].qty, 2.0);
        assert_eq!(intents[0].meta["slice_idx"], json!(0));
        assert_eq!(intents[0].meta["total_quantity"], json!(10.0));
    }

    #[tokio::test]
    async fn replenishes_once_threshold_crossed_and_shrinks_final_slice() {
        let bus = Bus::new();
        let executor = IcebergExecutor::new(0.2, 0.5).unwrap();
        let algo = algo(10.0, 100.0);
        let intents = executor.plan_execution(&algo).unwrap();
        let execution_id = intents[0].execution_id().unwrap().to_string();

        let fill = |qty: f64| {
            serde_json::to_value(FillEvent {
                order_id: "x".into(),
                symbol: "BTC/USDT".into(),
                side: Side::Buy,
                qty,
                price: 100.0,
                ts_fill_ns: 0,
                fee: 0.0,
                meta: [("execution_id".to_string(), json!(execution_id.clone()))].into(),
            })
            .unwrap()
        };

        let bus_clone = bus.clone();
        let algo_clone = algo.clone();
        let exec_id_clone = execution_id.clone();
        let handle = tokio::spawn(async move {
            executor.monitor_and_replenish(&bus_clone, exec_id_clone, &algo_clone).await
        });
        tokio::task::yield_now().await;

        // 2.0 visible, threshold 0.5 => need 1.0 filled to replenish.
        bus.publish("fills.new", fill(0.5));
        bus.publish("fills.new", fill(0.5));
        // Remaining total after first visible slice (2.0) is 8.0, still > visible_qty (2.0).
        // Fill it all to drain down to under one more visible slice.
        for _ in 0..3 {
            bus.publish("fills.new", fill(2.0));
        }
        // total filled so far: 2.0 (initial) + 6.0 = 8.0, remaining = 2.0, exactly one slice.
        bus.publish("fills.new", fill(2.0));

        let replenishments = handle.await.unwrap();
        assert!(!replenishments.is_empty());
        let last = replenishments.last().unwrap();
        assert!(last.qty <= 2.0 + 1e-9);
    }
}
