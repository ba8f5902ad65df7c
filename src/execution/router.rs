//! Smart order router: picks an executor from market characteristics and
//! urgency, drives its planning, and publishes the resulting intents.

use std::collections::HashMap;

use serde_json::json;

use crate::bus::Bus;
use crate::execution::base::{generate_execution_id, Executor};
use crate::execution::contracts::{AlgoType, ExecutionAlgorithm, ExecutionIntent, Side};
use crate::execution::{IcebergExecutor, TwapExecutor, VwapExecutor};

/// The order handed to the router before an algorithm has been chosen.
#[derive(Debug, Clone)]
pub struct ParentIntent {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub params: HashMap<String, serde_json::Value>,
}

/// Market characteristics consulted by the selection rules. The router
/// does not measure these itself; callers supply a fresh reading.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarketContext {
    pub avg_volume_1h: f64,
    pub volume_volatility: f64,
}

fn default_duration_seconds(qty: f64) -> u64 {
    if qty < 10.0 {
        300
    } else if qty < 100.0 {
        600
    } else {
        900
    }
}

fn select_algo_type(parent: &ParentIntent, urgency_seconds: Option<u64>, market: MarketContext) -> AlgoType {
    if let Some(u) = urgency_seconds {
        if u < 60 {
            return AlgoType::Pov;
        }
    }
    if parent.qty > 10.0 * market.avg_volume_1h {
        return AlgoType::Iceberg;
    }
    if market.volume_volatility > 0.5 {
        return AlgoType::Vwap;
    }
    AlgoType::Twap
}

pub struct SmartOrderRouter {
    bus: Bus,
    twap: TwapExecutor,
    vwap: VwapExecutor,
    iceberg: IcebergExecutor,
}

impl SmartOrderRouter {
    pub fn new(bus: Bus) -> Self {
        Self {
            bus,
            twap: TwapExecutor::default(),
            vwap: VwapExecutor::default(),
            iceberg: IcebergExecutor::default(),
        }
    }

    /// Selects an executor, plans the parent intent, augments and
    /// publishes every resulting child intent, and returns the fresh
    /// `execution_id`. POV is excluded from the pure-planning fallback
    /// chain here because its planning path needs a live volume reading
    /// (see `PovExecutor::plan_with_volume`); urgency-driven POV routing
    /// is handled by callers that already have that reading in hand.
    pub fn route_order(
        &self,
        parent: &ParentIntent,
        urgency_seconds: Option<u64>,
        market: MarketContext,
    ) -> Result<String, String> {
        let algo_type = select_algo_type(parent, urgency_seconds, market);
        let duration_seconds = default_duration_seconds(parent.qty);
        let algo = ExecutionAlgorithm::new(
            algo_type,
            parent.symbol.clone(),
            parent.side,
            parent.qty,
            duration_seconds,
            parent.params.clone(),
        )?;

        let plan_result = match algo_type {
            AlgoType::Twap => self.twap.plan_execution(&algo),
            AlgoType::Vwap => self.vwap.plan_execution(&algo),
            AlgoType::Iceberg => self.iceberg.plan_execution(&algo),
            // No live volume reading available here; fall back to TWAP,
            // matching the "no registered executor falls back to any
            // registered one" rule.
            AlgoType::Pov => self.twap.plan_execution(&algo),
        };

        let intents = plan_result.map_err(|e| format!("executor-failed: {e}"))?;
        let execution_id = generate_execution_id(algo_type.prefix());

        for mut intent in intents {
            augment_meta(&mut intent, &execution_id, &parent.id, algo_type);
            self.bus.publish("strat.intent", json!({ "intent": intent }));
        }

        Ok(execution_id)
    }
}

/// Sets correlation keys without overwriting ones the executor already
/// stamped (e.g. `slice_id`, `slice_idx`, `algo_type` are always present
/// already; `execution_id` is the fresh one assigned by the router, but
/// cancel intents already carry it from planning and should keep it).
fn augment_meta(intent: &mut ExecutionIntent, execution_id: &str, parent_intent_id: &str, algo_type: AlgoType) {
    intent.meta.entry("execution_id".to_string()).or_insert_with(|| json!(execution_id));
    intent.meta.entry("parent_intent_id".to_string()).or_insert_with(|| json!(parent_intent_id));
    intent.meta.entry("algo_type".to_string()).or_insert_with(|| json!(algo_type.as_str()));
}
