//! The backtest engine itself: bar-by-bar replay, position accounting,
//! and derived performance metrics.

use std::collections::VecDeque;

use crate::execution::contracts::{AlgoType, ExecutionAlgorithm, ExecutionIntent, Side};
use crate::execution::simulator::{simulate_execution, MarketBar};
use crate::execution::slippage::SlippageModel;
use crate::execution::{Executor, IcebergExecutor, TwapExecutor, VwapExecutor};

/// One historical bar fed to the strategy and, when an intent carries an
/// `meta.execution` block, to the execution simulator.
#[derive(Debug, Clone, Copy)]
pub struct Bar {
    pub ts_ns: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Strategies are driven bar-by-bar and return whatever child intents
/// they want placed against that bar.
pub trait Strategy {
    fn on_bar(&mut self, bar: &Bar) -> Vec<ExecutionIntent>;
}

/// Weighted-average-cost position. Same-direction adds extend the
/// average; opposite-direction fills reduce quantity directly rather
/// than flipping the cost basis.
#[derive(Debug, Clone, Copy, Default)]
pub struct Position {
    pub qty: f64,
    pub avg_price: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct Trade {
    pub ts_ns: i64,
    pub side: Side,
    pub qty: f64,
    pub price: f64,
    pub commission: f64,
}

#[derive(Debug, Clone)]
pub struct BacktestResult {
    pub equity_curve: Vec<(i64, f64)>,
    pub final_capital: f64,
    pub trade_count: usize,
    pub total_return_pct: f64,
    pub sharpe_ratio: f64,
    pub max_drawdown_pct: f64,
    pub win_rate: f64,
    pub profit_factor: f64,
}

pub struct BacktestEngine {
    initial_capital: f64,
    commission_rate: f64,
    slippage: SlippageModel,
    cash: f64,
    position: Position,
    equity_curve: Vec<(i64, f64)>,
    trades: Vec<Trade>,
}

impl BacktestEngine {
    pub fn new(initial_capital: f64, commission_rate: f64, slippage: SlippageModel) -> Self {
        Self {
            initial_capital,
            commission_rate,
            slippage,
            cash: initial_capital,
            position: Position::default(),
            equity_curve: Vec::new(),
            trades: Vec::new(),
        }
    }

    fn equity_at(&self, price: f64) -> f64 {
        self.cash + self.position.qty * price
    }

    fn apply_direct_fill(&mut self, ts_ns: i64, side: Side, qty: f64, price: f64) -> Result<(), String> {
        let commission = price * qty * self.commission_rate;
        match side {
            Side::Buy => {
                let notional = price * qty + commission;
                if notional > self.cash {
                    return Err(format!("insufficient cash: need {notional}, have {}", self.cash));
                }
                self.cash -= notional;
                let new_qty = self.position.qty + qty;
                self.position.avg_price = if new_qty > 0.0 {
                    (self.position.avg_price * self.position.qty + price * qty) / new_qty
                } else {
                    self.position.avg_price
                };
                self.position.qty = new_qty;
            }
            Side::Sell => {
                if qty > self.position.qty {
                    return Err(format!("insufficient position: need {qty}, have {}", self.position.qty));
                }
                self.cash += price * qty - commission;
                self.position.qty -= qty;
            }
        }
        self.trades.push(Trade { ts_ns, side, qty, price, commission });
        Ok(())
    }

    fn executor_for(algo_type: AlgoType) -> Option<Box<dyn Executor>> {
        match algo_type {
            AlgoType::Twap => Some(Box::new(TwapExecutor::default())),
            AlgoType::Vwap => Some(Box::new(VwapExecutor::default())),
            AlgoType::Iceberg => Some(Box::new(IcebergExecutor::default())),
            AlgoType::Pov => None, // needs a live volume reading; unsupported inside a bar-driven replay
        }
    }

    fn run_execution_intent(&mut self, intent: &ExecutionIntent, window: &[MarketBar]) -> Result<(), String> {
        let execution_value = intent
            .meta
            .get("execution")
            .ok_or("missing meta.execution block")?;
        let algo_type_str = execution_value
            .get("algo_type")
            .and_then(|v| v.as_str())
            .ok_or("meta.execution.algo_type is required")?;
        let algo_type = match algo_type_str.to_ascii_uppercase().as_str() {
            "TWAP" => AlgoType::Twap,
            "VWAP" => AlgoType::Vwap,
            "ICEBERG" => AlgoType::Iceberg,
            "POV" => AlgoType::Pov,
            other => return Err(format!("unknown algo_type '{other}'")),
        };
        let executor = Self::executor_for(algo_type)
            .ok_or_else(|| format!("no executor registered for {algo_type_str}"))?;

        let duration_seconds = execution_value
            .get("duration_seconds")
            .and_then(|v| v.as_u64())
            .unwrap_or(300);
        let params = execution_value
            .get("executor_params")
            .and_then(|v| v.as_object())
            .map(|m| m.clone().into_iter().collect())
            .unwrap_or_default();

        let algo = ExecutionAlgorithm::new(
            algo_type,
            intent.symbol.clone(),
            intent.side,
            intent.qty,
            duration_seconds,
            params,
        )?;
        let child_intents = executor.plan_execution(&algo)?;

        let execution_id = child_intents
            .first()
            .and_then(|i| i.execution_id())
            .unwrap_or("unknown")
            .to_string();
        let report = simulate_execution(
            &execution_id,
            &intent.symbol,
            algo.total_quantity,
            child_intents.len() as u32,
            window.first().map(|b| b.ts_open_ns).unwrap_or(0),
            &child_intents,
            window,
            self.slippage,
            None,
        )?;

        if report.filled_quantity > 0.0 {
            self.apply_direct_fill(
                window.first().map(|b| b.ts_open_ns).unwrap_or(0),
                intent.side,
                report.filled_quantity,
                report.avg_fill_price,
            )?;
        }
        Ok(())
    }

    /// Replays `bars` against `strategy`. For each bar, intents without a
    /// `meta.execution` block fill directly at the bar's close; intents
    /// carrying one are run through the execution simulator over the
    /// remaining bars in the window.
    pub fn run(&mut self, bars: &[Bar], strategy: &mut dyn Strategy) -> BacktestResult {
        for (idx, bar) in bars.iter().enumerate() {
            let intents = strategy.on_bar(bar);
            let window: Vec<MarketBar> = bars[idx..]
                .iter()
                .map(|b| MarketBar { ts_open_ns: b.ts_ns, close: b.close, volume: b.volume })
                .collect();

            for intent in &intents {
                if intent.qty <= 0.0 {
                    continue;
                }
                let result = if intent.meta.contains_key("execution") {
                    self.run_execution_intent(intent, &window)
                } else {
                    self.apply_direct_fill(bar.ts_ns, intent.side, intent.qty, bar.close)
                };
                if let Err(err) = result {
                    tracing::warn!(error = %err, "backtest intent rejected");
                }
            }

            self.equity_curve.push((bar.ts_ns, self.equity_at(bar.close)));
        }

        self.finish()
    }

    fn finish(&self) -> BacktestResult {
        let final_capital = self.equity_curve.last().map(|(_, e)| *e).unwrap_or(self.initial_capital);
        let total_return_pct = (final_capital - self.initial_capital) / self.initial_capital * 100.0;

        let returns: Vec<f64> = self
            .equity_curve
            .windows(2)
            .map(|w| (w[1].1 - w[0].1) / w[0].1)
            .collect();
        let sharpe_ratio = sharpe_from_returns(&returns);
        let max_drawdown_pct = max_drawdown(&self.equity_curve);
        let (win_rate, profit_factor) = fifo_pairing_stats(&self.trades);

        BacktestResult {
            equity_curve: self.equity_curve.clone(),
            final_capital,
            trade_count: self.trades.len(),
            total_return_pct,
            sharpe_ratio,
            max_drawdown_pct,
            win_rate,
            profit_factor,
        }
    }
}

/// `365^0.5`-annualized Sharpe from per-step returns' mean/stddev.
/// Calendar-day annualization, not trading-day; preserved intentionally.
fn sharpe_from_returns(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (returns.len() - 1) as f64;
    let stddev = variance.sqrt();
    if stddev == 0.0 {
        return 0.0;
    }
    (mean / stddev) * 365f64.sqrt()
}

/// Running-peak drawdown, expressed as a positive percentage.
fn max_drawdown(equity_curve: &[(i64, f64)]) -> f64 {
    let mut peak = f64::MIN;
    let mut max_dd: f64 = 0.0;
    for &(_, equity) in equity_curve {
        peak = peak.max(equity);
        if peak > 0.0 {
            let dd = (peak - equity) / peak * 100.0;
            max_dd = max_dd.max(dd);
        }
    }
    max_dd
}

/// FIFO-pairs buy trades against sell trades in execution order. A pair
/// is a win when the sell price exceeds the buy price; profit factor is
/// gross profit over gross loss across all pairs.
fn fifo_pairing_stats(trades: &[Trade]) -> (f64, f64) {
    let mut open_buys: VecDeque<(f64, f64)> = VecDeque::new(); // (qty, price)
    let mut wins = 0u32;
    let mut pairs = 0u32;
    let mut gross_profit = 0.0;
    let mut gross_loss = 0.0;

    for trade in trades {
        match trade.side {
            Side::Buy => open_buys.push_back((trade.qty, trade.price)),
            Side::Sell => {
                let mut remaining = trade.qty;
                while remaining > 1e-12 {
                    let Some((buy_qty, buy_price)) = open_buys.front().copied() else { break };
                    let matched_qty = buy_qty.min(remaining);
                    let pnl = (trade.price - buy_price) * matched_qty;
                    pairs += 1;
                    if pnl > 0.0 {
                        wins += 1;
                        gross_profit += pnl;
                    } else {
                        gross_loss += -pnl;
                    }
                    remaining -= matched_qty;
                    let leftover = buy_qty - matched_qty;
                    if leftover <= 1e-12 {
                        open_buys.pop_front();
                    } else {
                        open_buys[0].0 = leftover;
                    }
                }
            }
        }
    }

    let win_rate = if pairs > 0 { wins as f64 / pairs as f64 } else { 0.0 };
    let profit_factor = if gross_loss > 0.0 { gross_profit / gross_loss } else { gross_profit };
    (win_rate, profit_factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BuyHoldOnce {
        bought: bool,
    }

    impl Strategy for BuyHoldOnce {
        fn on_bar(&mut self, bar: &Bar) -> Vec<ExecutionIntent> {
            if self.bought {
                return Vec::new();
            }
            self.bought = true;
            vec![ExecutionIntent {
                id: "buy_1".to_string(),
                ts_local_ns: bar.ts_ns,
                symbol: "BTC/USDT".to_string(),
                side: Side::Buy,
                order_type: crate::execution::contracts::OrderType::Market,
                qty: 10.0,
                limit_price: None,
                meta: Default::default(),
            }]
        }
    }

    fn bars() -> Vec<Bar> {
        (0..10)
            .map(|i| Bar {
                ts_ns: i as i64 * 60_000_000_000,
                open: 100.0 + i as f64,
                high: 101.0 + i as f64,
                low: 99.0 + i as f64,
                close: 100.0 + i as f64,
                volume: 1000.0,
            })
            .collect()
    }

    #[test]
    fn two_runs_with_identical_inputs_are_deterministic() {
        let slippage = SlippageModel::Linear { coefficient: 0.0 };
        let mut engine_a = BacktestEngine::new(10_000.0, 0.0, slippage);
        let mut strategy_a = BuyHoldOnce { bought: false };
        let result_a = engine_a.run(&bars(), &mut strategy_a);

        let mut engine_b = BacktestEngine::new(10_000.0, 0.0, slippage);
        let mut strategy_b = BuyHoldOnce { bought: false };
        let result_b = engine_b.run(&bars(), &mut strategy_b);

        assert_eq!(result_a.equity_curve, result_b.equity_curve);
        assert_eq!(result_a.final_capital, result_b.final_capital);
        assert_eq!(result_a.trade_count, result_b.trade_count);
    }

    #[test]
    fn buying_and_holding_tracks_unrealized_equity() {
        let slippage = SlippageModel::Linear { coefficient: 0.0 };
        let mut engine = BacktestEngine::new(10_000.0, 0.0, slippage);
        let mut strategy = BuyHoldOnce { bought: false };
        let result = engine.run(&bars(), &mut strategy);

        assert_eq!(result.trade_count, 1);
        // Bought 10 units at bar 0's close (100.0); final bar close is 109.0.
        let expected_final = (10_000.0 - 1000.0) + 10.0 * 109.0;
        assert!((result.final_capital - expected_final).abs() < 1e-6);
        assert!(result.total_return_pct > 0.0);
    }

    #[test]
    fn fifo_pairing_computes_win_rate_and_profit_factor() {
        let trades = vec![
            Trade { ts_ns: 0, side: Side::Buy, qty: 1.0, price: 100.0, commission: 0.0 },
            Trade { ts_ns: 1, side: Side::Sell, qty: 1.0, price: 110.0, commission: 0.0 },
            Trade { ts_ns: 2, side: Side::Buy, qty: 1.0, price: 100.0, commission: 0.0 },
            Trade { ts_ns: 3, side: Side::Sell, qty: 1.0, price: 90.0, commission: 0.0 },
        ];
        let (win_rate, profit_factor) = fifo_pairing_stats(&trades);
        assert!((win_rate - 0.5).abs() < 1e-9);
        assert!((profit_factor - 1.0).abs() < 1e-9); // gross profit 10, gross loss 10
    }

    #[test]
    fn insufficient_cash_rejects_the_buy_without_panicking() {
        let slippage = SlippageModel::Linear { coefficient: 0.0 };
        let mut engine = BacktestEngine::new(1.0, 0.0, slippage);
        let mut strategy = BuyHoldOnce { bought: false };
        let result = engine.run(&bars(), &mut strategy);
        assert_eq!(result.trade_count, 0);
        assert_eq!(result.final_capital, 1.0);
    }
}
