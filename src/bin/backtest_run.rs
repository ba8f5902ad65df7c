//! Standalone backtest runner: replays a journal of OHLCV bars for a
//! symbol through a named strategy and writes the resulting equity curve.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use chrono::NaiveDate;
use clap::Parser;
use njord_core::backtest::{Bar, BacktestEngine, Strategy};
use njord_core::config::setup_logging;
use njord_core::execution::contracts::{ExecutionIntent, OrderType, Side};
use njord_core::execution::slippage::SlippageModel;
use serde::Deserialize;

#[derive(Parser, Debug)]
#[command(name = "backtest-run")]
struct Args {
    #[arg(long)]
    strategy: String,

    #[arg(long)]
    symbol: String,

    #[arg(long)]
    start: Option<String>,

    #[arg(long)]
    end: Option<String>,

    #[arg(long, default_value_t = 100_000.0)]
    capital: f64,

    #[arg(long, default_value_t = 0.001)]
    commission: f64,

    #[arg(long, default_value_t = 0.1)]
    slippage: f64,

    #[arg(long)]
    journal_dir: PathBuf,

    #[arg(long, default_value = ".")]
    output_dir: PathBuf,
}

#[derive(Deserialize)]
struct BarRecord {
    ts_ns: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

fn parse_date_bound(value: &Option<String>) -> Option<i64> {
    let value = value.as_ref()?;
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc().timestamp_nanos_opt().unwrap_or(0))
}

fn load_bars(journal_dir: &std::path::Path, symbol: &str, start: Option<i64>, end: Option<i64>) -> anyhow::Result<Vec<Bar>> {
    let sanitized = symbol.replace('/', "_");
    let path = journal_dir.join(format!("{sanitized}.ndjson"));
    let file = std::fs::File::open(&path).map_err(|e| anyhow::anyhow!("opening {}: {e}", path.display()))?;
    let reader = BufReader::new(file);

    let mut bars = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: BarRecord = serde_json::from_str(&line)?;
        if start.is_some_and(|s| record.ts_ns < s) || end.is_some_and(|e| record.ts_ns > e) {
            continue;
        }
        bars.push(Bar {
            ts_ns: record.ts_ns,
            open: record.open,
            high: record.high,
            low: record.low,
            close: record.close,
            volume: record.volume,
        });
    }
    bars.sort_by_key(|b| b.ts_ns);
    Ok(bars)
}

/// Buys as much of the symbol as `capital` allows on the first bar and
/// holds for the rest of the window.
struct BuyHold {
    capital: f64,
    bought: bool,
    symbol: String,
}

impl Strategy for BuyHold {
    fn on_bar(&mut self, bar: &Bar) -> Vec<ExecutionIntent> {
        if self.bought || bar.close <= 0.0 {
            return Vec::new();
        }
        self.bought = true;
        let qty = (self.capital * 0.99 / bar.close).floor().max(0.0);
        if qty <= 0.0 {
            return Vec::new();
        }
        vec![ExecutionIntent {
            id: "buy_hold_entry".to_string(),
            ts_local_ns: bar.ts_ns,
            symbol: self.symbol.clone(),
            side: Side::Buy,
            order_type: OrderType::Market,
            qty,
            limit_price: None,
            meta: Default::default(),
        }]
    }
}

fn build_strategy(name: &str, capital: f64, symbol: &str) -> anyhow::Result<Box<dyn Strategy>> {
    match name {
        "buy_hold" | "BuyHold" => Ok(Box::new(BuyHold { capital, bought: false, symbol: symbol.to_string() })),
        other => anyhow::bail!("unknown strategy '{other}'; only 'buy_hold' is built in"),
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    setup_logging("info");

    let start = parse_date_bound(&args.start);
    let end = parse_date_bound(&args.end);
    let bars = load_bars(&args.journal_dir, &args.symbol, start, end)?;
    if bars.is_empty() {
        anyhow::bail!("no bars loaded for {} from {}", args.symbol, args.journal_dir.display());
    }

    let mut strategy = build_strategy(&args.strategy, args.capital, &args.symbol)?;
    let mut engine = BacktestEngine::new(
        args.capital,
        args.commission,
        SlippageModel::Linear { coefficient: args.slippage },
    );
    let result = engine.run(&bars, strategy.as_mut());

    tracing::info!(
        final_capital = result.final_capital,
        trade_count = result.trade_count,
        total_return_pct = result.total_return_pct,
        sharpe_ratio = result.sharpe_ratio,
        max_drawdown_pct = result.max_drawdown_pct,
        win_rate = result.win_rate,
        profit_factor = result.profit_factor,
        "backtest complete"
    );

    std::fs::create_dir_all(&args.output_dir)?;
    let sanitized_symbol = args.symbol.replace('/', "_");
    let out_path = args.output_dir.join(format!("equity_{}_{}.ndjson", args.strategy, sanitized_symbol));
    let mut out = std::fs::File::create(&out_path)?;
    for (ts_ns, equity) in &result.equity_curve {
        writeln!(out, "{}", serde_json::json!({ "ts_ns": ts_ns, "equity": equity }))?;
    }
    println!("wrote equity curve to {}", out_path.display());

    Ok(())
}
