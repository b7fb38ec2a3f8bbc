//! droid-waiter
//!
//! Replays bounded-wait scenarios from TOML files.
//!
//! ```text
//! droid-waiter [--config PATH] [--json] SCENARIO.toml...
//! ```

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use droid_waiter::commands::SimulateCommand;
use droid_waiter::core::WaiterConfig;
use droid_waiter::{APP_NAME, VERSION};

/// Replay bounded-wait scenarios on a manual clock
#[derive(Parser, Debug)]
#[command(name = "droid-waiter", author, version, about, long_about = None)]
struct Args {
    /// Configuration file to use instead of the default location
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print one JSON report per scenario
    #[arg(long)]
    json: bool,

    /// Scenario files to replay
    #[arg(required = true)]
    scenarios: Vec<PathBuf>,
}

/// Main entry point
#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("{} v{} starting...", APP_NAME, VERSION);

    let config = match &args.config {
        Some(path) => WaiterConfig::load_from(path).await?,
        None => WaiterConfig::load().await?,
    };

    let mut failures = 0;
    for path in &args.scenarios {
        let command = SimulateCommand {
            scenario_path: path.clone(),
        };

        match command.execute(&config.wait).await {
            Ok(report) if args.json => println!("{}", serde_json::to_string(&report)?),
            Ok(report) => println!("{}", report),
            Err(e) => {
                error!("{:#}", e);
                failures += 1;
            }
        }
    }

    if failures > 0 {
        bail!("{} of {} scenarios failed", failures, args.scenarios.len());
    }
    Ok(())
}
