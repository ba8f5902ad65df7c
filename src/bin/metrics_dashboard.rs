//! Runs the Scraper HTTP server (Prometheus `/metrics` plus the dashboard
//! `/`, `/api/metrics`, `/stream` endpoints) over a shared registry.

use std::path::PathBuf;

use clap::Parser;
use njord_core::config::{load_config, setup_logging};
use njord_core::telemetry::{MetricRegistry, Scraper};
use njord_core::Bus;

#[derive(Parser, Debug)]
#[command(name = "metrics-dashboard")]
struct Args {
    #[arg(long, default_value = "config", env = "NJORD_CONFIG_ROOT")]
    config_root: PathBuf,

    #[arg(long)]
    bind_host: Option<String>,

    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    setup_logging("info");
    let config = load_config(&args.config_root);
    let bind_host = args.bind_host.unwrap_or(config.scraper.host);
    let port = args.port.unwrap_or(config.scraper.port);

    let auth_token = std::env::var("NJORD_DASHBOARD_TOKEN").ok();
    let bus = Bus::new();
    let registry = MetricRegistry::new();
    let scraper = Scraper::new(bus, registry, auth_token);

    tracing::info!(%bind_host, port, "metrics-dashboard starting");
    scraper.run(&bind_host, port).await
}
