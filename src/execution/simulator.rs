//! Execution simulator: the C8 adapter the backtest engine drives
//! synchronously, turning planned intents into fills against a window of
//! historical bars.

use crate::execution::contracts::{summarize_fills, ExecutionIntent, ExecutionReport, FillEvent, Side};
use crate::execution::slippage::SlippageModel;

const FEE_RATE: f64 = 0.001;
const DEFAULT_SPREAD_FRACTION: f64 = 0.0005;

/// One bar of the market window the simulator replays against.
#[derive(Debug, Clone, Copy)]
pub struct MarketBar {
    pub ts_open_ns: i64,
    pub close: f64,
    pub volume: f64,
}

/// Picks the bar whose `ts_open_ns` is closest to `target_ts_ns`. Empty
/// windows have no sensible answer; callers must not invoke the simulator
/// without at least one bar.
fn nearest_bar(window: &[MarketBar], target_ts_ns: i64) -> &MarketBar {
    window
        .iter()
        .min_by_key(|b| (b.ts_open_ns - target_ts_ns).abs())
        .expect("market window must not be empty")
}

/// Simulates fills for every planned intent in `intents` against
/// `window`, then aggregates them into one `ExecutionReport`.
pub fn simulate_execution(
    execution_id: &str,
    symbol: &str,
    total_quantity: f64,
    slices_total: u32,
    start_ts_ns: i64,
    intents: &[ExecutionIntent],
    window: &[MarketBar],
    slippage: SlippageModel,
    benchmark_vwap: Option<f64>,
) -> Result<ExecutionReport, String> {
    if window.is_empty() {
        return Err("market window must contain at least one bar".to_string());
    }

    let mut fills = Vec::with_capacity(intents.len());
    for intent in intents {
        if intent.qty <= 0.0 {
            continue; // cancellations carry no fill
        }
        let scheduled_ts_ns = intent
            .meta
            .get("scheduled_ts_ns")
            .and_then(|v| v.as_i64())
            .unwrap_or(window[0].ts_open_ns);
        let bar = nearest_bar(window, scheduled_ts_ns);
        let spread = intent
            .meta
            .get("spread")
            .and_then(|v| v.as_f64())
            .unwrap_or(bar.close * DEFAULT_SPREAD_FRACTION);

        let impact = slippage.impact(intent.qty, bar.volume, spread, bar.close)?;
        let fill_price = match intent.side {
            Side::Buy => bar.close + impact,
            Side::Sell => bar.close - impact,
        };
        let fee = fill_price * intent.qty * FEE_RATE;

        fills.push(FillEvent {
            order_id: intent.id.clone(),
            symbol: symbol.to_string(),
            side: intent.side,
            qty: intent.qty,
            price: fill_price,
            ts_fill_ns: bar.ts_open_ns,
            fee,
            meta: intent.meta.clone(),
        });
    }

    Ok(summarize_fills(
        execution_id,
        symbol,
        total_quantity,
        slices_total,
        start_ts_ns,
        &fills,
        benchmark_vwap,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::contracts::{AlgoType, OrderType};
    use std::collections::HashMap;

    fn intent(id: &str, qty: f64, side: Side, scheduled_ts_ns: i64) -> ExecutionIntent {
        let mut meta = HashMap::new();
        meta.insert("execution_id".to_string(), serde_json::json!("exec_1"));
        meta.insert("algo_type".to_string(), serde_json::json!(AlgoType::Twap.as_str()));
        meta.insert("scheduled_ts_ns".to_string(), serde_json::json!(scheduled_ts_ns));
        ExecutionIntent {
            id: id.to_string(),
            ts_local_ns: scheduled_ts_ns,
            symbol: "BTC/USDT".to_string(),
            side,
            order_type: OrderType::Limit,
            qty,
            limit_price: Some(100.0),
            meta,
        }
    }

    #[test]
    fn empty_fills_produce_a_failed_report() {
        let window = vec![MarketBar { ts_open_ns: 0, close: 100.0, volume: 1000.0 }];
        let report = simulate_execution(
            "exec_1",
            "BTC/USDT",
            1.0,
            1,
            0,
            &[],
            &window,
            SlippageModel::Linear { coefficient: 0.1 },
            None,
        )
        .unwrap();
        assert_eq!(report.status, crate::execution::contracts::ExecutionStatus::Failed);
    }

    #[test]
    fn buy_fills_above_close_sell_fills_below() {
        let window = vec![MarketBar { ts_open_ns: 0, close: 100.0, volume: 1000.0 }];
        let buy = vec![intent("buy_1", 10.0, Side::Buy, 0)];
        let sell = vec![intent("sell_1", 10.0, Side::Sell, 0)];

        let buy_report = simulate_execution(
            "exec_1", "BTC/USDT", 10.0, 1, 0, &buy, &window,
            SlippageModel::Linear { coefficient: 0.1 }, None,
        )
        .unwrap();
        let sell_report = simulate_execution(
            "exec_2", "BTC/USDT", 10.0, 1, 0, &sell, &window,
            SlippageModel::Linear { coefficient: 0.1 }, None,
        )
        .unwrap();

        assert!(buy_report.avg_fill_price > 100.0);
        assert!(sell_report.avg_fill_price < 100.0);
    }

    #[test]
    fn nearest_bar_is_picked_by_scheduled_timestamp() {
        let window = vec![
            MarketBar { ts_open_ns: 0, close: 100.0, volume: 1000.0 },
            MarketBar { ts_open_ns: 60_000_000_000, close: 110.0, volume: 1000.0 },
        ];
        let intents = vec![intent("a", 1.0, Side::Buy, 59_000_000_000)];
        let report = simulate_execution(
            "exec_1", "BTC/USDT", 1.0, 1, 0, &intents, &window,
            SlippageModel::Linear { coefficient: 0.0 }, None,
        )
        .unwrap();
        // nearest bar is the second one (close 110), spread is 0 so avg_fill_price == 110.
        assert!((report.avg_fill_price - 110.0).abs() < 1e-6);
    }

    #[test]
    fn fee_is_a_fixed_fraction_of_notional() {
        let window = vec![MarketBar { ts_open_ns: 0, close: 100.0, volume: 1000.0 }];
        let intents = vec![intent("a", 10.0, Side::Buy, 0)];
        let report = simulate_execution(
            "exec_1", "BTC/USDT", 10.0, 1, 0, &intents, &window,
            SlippageModel::Linear { coefficient: 0.0 }, None,
        )
        .unwrap();
        let expected_fee = report.avg_fill_price * 10.0 * FEE_RATE;
        assert!((report.total_fees - expected_fee).abs() < 1e-6);
    }
}
