/*!
 * Warren CLI
 */

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use warren::{
    config::WarrenConfig,
    logging, report,
    simulate::{run_simulation, SimulationOptions},
};

#[derive(Parser)]
#[command(name = "warren")]
#[command(version, about = "Resilient connection and channel pooling for message brokers", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short = 'c', long = "config", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive concurrent publishers through the pool against an in-memory broker
    Simulate {
        /// Number of concurrent callers
        #[arg(long, default_value_t = 8)]
        callers: usize,

        /// Publishes per caller
        #[arg(long, default_value_t = 50)]
        operations: usize,

        /// Probability (0.0 - 1.0) that a broker call fails
        #[arg(long, default_value_t = 0.0)]
        failure_rate: f64,

        /// Broker latency per publish in milliseconds
        #[arg(long, default_value_t = 5)]
        op_latency_ms: u64,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate and print the effective configuration
    Config,
}

fn load_config(path: Option<&PathBuf>) -> Result<WarrenConfig> {
    match path {
        Some(path) => WarrenConfig::from_file(path)
            .with_context(|| format!("Failed to load config file {}", path.display())),
        None => Ok(WarrenConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
        Commands::Simulate {
            callers,
            operations,
            failure_rate,
            op_latency_ms,
            json,
        } => {
            if !(0.0..=1.0).contains(&failure_rate) {
                anyhow::bail!("--failure-rate must be between 0.0 and 1.0");
            }
            if let Err(e) = logging::init_logging(&config.logging, cli.verbose) {
                eprintln!("Warning: Failed to initialize logging: {}", e);
            }

            let options = SimulationOptions {
                callers,
                operations,
                failure_rate,
                op_latency: Duration::from_millis(op_latency_ms),
                ..SimulationOptions::default()
            };

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, stopping simulation");
                    on_signal.cancel();
                }
            });

            let result = run_simulation(&config, &options, &cancel)
                .await
                .context("Simulation failed")?;

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("{}", report::outcome_table(&result));
                println!();
                println!("{}", report::pool_stats_table(&result.pool));
                println!();
                println!("{}", report::broker_stats_table(&result.broker));
            }
            Ok(())
        }
    }
}
