//! One-shot invocation of `RetentionEngine::apply_retention`, for manual
//! or cron-driven cleanup of the aggregated-journal directory.

use std::path::PathBuf;

use clap::Parser;
use njord_core::config::setup_logging;
use njord_core::telemetry::{RetentionEngine, RetentionPolicy};

#[derive(Parser, Debug)]
#[command(name = "metrics-cleanup")]
struct Args {
    #[arg(long)]
    journal_dir: PathBuf,

    #[arg(long, default_value = "config")]
    config_root: PathBuf,

    /// Load and validate the policy without touching any files.
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    #[arg(long, default_value_t = false)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    setup_logging(if args.verbose { "debug" } else { "info" });

    let policy = RetentionPolicy::load(&args.config_root);
    if let Err(err) = RetentionPolicy::validate_cron(&policy.cleanup_schedule) {
        anyhow::bail!("invalid cleanup schedule in policy: {err}");
    }

    if args.dry_run {
        println!("dry run: policy loaded and validated, no files touched");
        println!("tiers: {:?}", policy.sorted_tiers());
        return Ok(());
    }

    let engine = RetentionEngine::new(args.journal_dir, policy);
    let stats = engine.apply_retention();
    println!(
        "downsampled={} compressed={} deleted={}",
        stats.downsampled, stats.compressed, stats.deleted
    );
    Ok(())
}
