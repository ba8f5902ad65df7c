//! Shared executor contract and the fill-correlation subscription every
//! algorithm uses to watch its own child orders.

use async_trait::async_trait;
use uuid::Uuid;

use crate::bus::Bus;
use crate::execution::contracts::{ExecutionAlgorithm, ExecutionIntent, FillEvent};

/// Generates `{prefix}_{8 hex chars}`, matching the source's
/// `f"{algo}_{uuid4().hex[:8]}"` id shape.
pub fn generate_execution_id(prefix: &str) -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{prefix}_{}", &id[..8])
}

/// Every execution algorithm implements planning as a pure function: given
/// an `ExecutionAlgorithm`, produce the full sequence of child intents up
/// front. This is the path the backtest engine drives synchronously; it
/// performs no I/O and never suspends.
#[async_trait]
pub trait Executor: Send + Sync {
    fn algo_type(&self) -> crate::execution::contracts::AlgoType;

    /// Pure planning path: never suspends, safe to call from sync code
    /// (the backtest engine) as well as from async services.
    fn plan_execution(&self, algo: &ExecutionAlgorithm) -> Result<Vec<ExecutionIntent>, String>;
}

/// Subscribes to `fills.new`, yielding only fills whose
/// `meta.execution_id` matches. Closing the returned subscription stops
/// tracking; this replaces the source's filtered async-generator pattern.
pub struct FillTracker {
    sub: crate::bus::Subscription,
    execution_id: String,
}

impl FillTracker {
    pub fn new(bus: &Bus, execution_id: impl Into<String>) -> Self {
        Self {
            sub: bus.subscribe("fills.new"),
            execution_id: execution_id.into(),
        }
    }

    pub async fn next_fill(&mut self) -> Option<FillEvent> {
        loop {
            let payload = self.sub.recv().await?;
            match serde_json::from_value::<FillEvent>(payload) {
                Ok(fill) if fill.execution_id() == Some(self.execution_id.as_str()) => {
                    return Some(fill)
                }
                Ok(_) => continue,
                Err(_) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_carry_the_expected_prefix_and_length() {
        let id = generate_execution_id("twap");
        assert!(id.starts_with("twap_"));
        assert_eq!(id.len(), "twap_".len() + 8);
    }

    #[tokio::test]
    async fn fill_tracker_filters_by_execution_id() {
        let bus = Bus::new();
        let mut tracker = FillTracker::new(&bus, "exec_1");

        let other = serde_json::json!({
            "order_id": "o1", "symbol": "BTC/USDT", "side": "buy", "qty": 1.0,
            "price": 100.0, "ts_fill_ns": 0, "fee": 0.0,
            "meta": {"execution_id": "exec_2"}
        });
        let mine = serde_json::json!({
            "order_id": "o2", "symbol": "BTC/USDT", "side": "buy", "qty": 1.0,
            "price": 100.0, "ts_fill_ns": 0, "fee": 0.0,
            "meta": {"execution_id": "exec_1"}
        });
        bus.publish("fills.new", other);
        bus.publish("fills.new", mine);

        let fill = tracker.next_fill().await.unwrap();
        assert_eq!(fill.order_id, "o2");
    }
}
