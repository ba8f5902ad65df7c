//! Runs the Aggregator against the shared Bus and Registry, flushing to
//! the aggregated journal until interrupted.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use njord_core::config::{load_config, setup_logging, ConfigReloader};
use njord_core::telemetry::MetricAggregator;
use njord_core::Bus;

#[derive(Parser, Debug)]
#[command(name = "metric-aggregator")]
struct Args {
    #[arg(long, default_value = "config", env = "NJORD_CONFIG_ROOT")]
    config_root: PathBuf,

    #[arg(long, default_value_t = 168)]
    retention_hours: u64,

    #[arg(long, default_value_t = 60)]
    flush_interval: u64,

    #[arg(long, default_value_t = 300)]
    grace_period: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    setup_logging("info");
    let config = load_config(&args.config_root);
    let journal_dir = config
        .log_dir
        .map(PathBuf::from)
        .unwrap_or_else(|| args.config_root.join("journal"));

    let bus = Bus::new();
    let registry = njord_core::telemetry::MetricRegistry::new();
    let aggregator = MetricAggregator::new(
        bus.clone(),
        registry,
        journal_dir,
        args.retention_hours,
        args.flush_interval,
        args.grace_period,
    );
    let reloader = ConfigReloader::new(
        bus,
        args.config_root.clone(),
        args.config_root.join("reload.journal"),
        Duration::from_secs(5),
    );

    tracing::info!("metric-aggregator starting");
    tokio::select! {
        _ = aggregator.run() => {}
        _ = reloader.run() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }
    Ok(())
}
