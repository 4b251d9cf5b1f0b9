use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use regwatch::baseline::{ThresholdComputer, WindowSize};
use regwatch::config::Config;
use regwatch::gateway::{self, AppState};
use regwatch::generator::Generator;
use regwatch::registry::AlgorithmRegistry;
use regwatch::storage::{self, Store};

#[derive(Parser, Debug)]
#[command(name = "regwatch", version, about = "Daily registration anomaly detection")]
struct Cli {
    /// Path to configuration file; built-in defaults apply when omitted
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP API
    Serve {
        /// Seed synthetic registrations and compute thresholds before serving
        #[arg(long)]
        generate: bool,
    },
    /// Seed synthetic registrations, then compute thresholds
    Generate,
    /// Recompute the threshold table from stored registrations
    Compute,
    /// Check one date and print the verdict as JSON
    Check {
        /// Date to check, YYYY-MM-DD
        #[arg(short, long)]
        date: String,
        /// Algorithm identifier; defaults to three-sigma
        #[arg(short, long, default_value = "")]
        algorithm: String,
    },
    /// Validate the configuration and exit
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => {
            let config = Config::default();
            config.validate()?;
            config
        }
    };

    if let Command::Validate = cli.command {
        println!("Configuration is valid.");
        return Ok(());
    }

    init_logging(&config)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        instance = %config.service.instance,
        "Starting regwatch"
    );

    if let Err(e) = run(cli.command, config).await {
        error!(error = %e, "regwatch terminated with error");
        return Err(e);
    }

    Ok(())
}

fn init_logging(config: &Config) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.service.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    Ok(())
}

async fn run(command: Command, config: Config) -> Result<()> {
    let window = WindowSize::try_from(config.thresholds.window_size_days)?;
    let computer = ThresholdComputer::new(window);
    let store = storage::open(&config.storage)
        .await
        .context("Failed to open storage")?;

    match command {
        Command::Serve { generate } => {
            if generate {
                seed(&config, store.as_ref(), &computer).await?;
            }
            let registry = Arc::new(AlgorithmRegistry::new(
                Arc::clone(&store),
                &config.registry,
                window,
            )?);
            let state = AppState::new(registry, store, computer);
            gateway::serve(&config.service.bind, state).await?;
        }
        Command::Generate => {
            seed(&config, store.as_ref(), &computer).await?;
        }
        Command::Compute => {
            let summary = computer.run(store.as_ref()).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Check { date, algorithm } => {
            let registry = AlgorithmRegistry::new(Arc::clone(&store), &config.registry, window)?;
            let output = registry.check(&algorithm, &date).await?;
            println!("{}", serde_json::to_string_pretty(&*output)?);
        }
        Command::Validate => {}
    }

    Ok(())
}

/// Append a synthetic batch and rebuild thresholds over everything stored
async fn seed(config: &Config, store: &dyn Store, computer: &ThresholdComputer) -> Result<()> {
    let events = Generator::new(&config.generator).observations();
    info!(
        events = events.len(),
        countries = config.generator.countries.len(),
        days = config.generator.registrations_period_days,
        "Generated synthetic registrations"
    );

    store
        .append_observations(&events)
        .await
        .context("Failed to store generated registrations")?;
    computer.run(store).await?;
    Ok(())
}
