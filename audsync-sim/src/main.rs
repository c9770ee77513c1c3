//! audsync - Room Simulator
//!
//! Runs a host and a handful of skewed followers against an in-memory
//! backend, with a terminal dashboard.
//!
//! Usage:
//!   cargo run --release
//!   cargo run --release -- --no-dashboard      # Plain logging mode
//!   cargo run --release -- --followers 5
//!   cargo run --release -- --config sync.json  # Override sync tunables

mod dashboard;
mod metrics;
mod sim;

use audsync_core::SyncConfig;
use parking_lot::RwLock;
use std::sync::Arc;

fn parse_options(args: &[String]) -> Result<sim::SimOptions, Box<dyn std::error::Error>> {
    let mut options = sim::SimOptions::default();
    let mut iter = args.iter().skip(1);

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--followers" => {
                let value = iter.next().ok_or("--followers needs a number")?;
                options.followers = value.parse()?;
            }
            "--config" => {
                let path = iter.next().ok_or("--config needs a path")?;
                options.config = SyncConfig::from_json(&std::fs::read_to_string(path)?)?;
            }
            "--no-crash" => options.crash = None,
            _ => {}
        }
    }
    Ok(options)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    let use_dashboard = !args.contains(&"--no-dashboard".to_string());
    let options = parse_options(&args)?;

    // Shared metrics state
    let metrics = Arc::new(RwLock::new(metrics::Metrics::new()));

    if use_dashboard {
        dashboard::run(metrics, options).await
    } else {
        sim::run_with_logging(metrics, options).await
    }
}
