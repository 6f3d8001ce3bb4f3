//! # Herald Server
//!
//! Per-campaign real-time orchestration service.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use herald_core::ranking::Formula;
use herald_server::infra::{
    config::{Config, ConfigLoad, ConfigLoader, ConfigLoaderOptions},
    startup::HeraldService,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "herald-server")]
#[command(about = "Per-campaign real-time orchestration: broadcasts, jobs and leaderboards")]
struct Cli {
    /// Path to herald.toml (defaults to HERALD_CONFIG, then ./herald.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Environment file loaded before reading variables
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the orchestration service until interrupted (default)
    Serve,
    /// Run one sweep over the currently active campaigns, print the report and exit
    Sweep {
        /// Concurrent campaign starts (overrides sweep.max_workers)
        #[arg(long)]
        max_workers: Option<usize>,
    },
    /// Check a ranking formula against the column whitelist and expression grammar
    ValidateFormula {
        /// e.g. "referral_count DESC, username ASC" or "expr: referral_count * 2"
        formula: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command.unwrap_or(Command::Serve) {
        Command::ValidateFormula { formula } => validate_formula(&formula),
        Command::Sweep { max_workers } => {
            let config = load_config(cli.config, cli.env_file)?;
            run_sweep(&config, max_workers).await
        }
        Command::Serve => {
            let config = load_config(cli.config, cli.env_file)?;
            run_server(&config).await
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,herald=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(
    config_path: Option<PathBuf>,
    env_file: Option<PathBuf>,
) -> anyhow::Result<Config> {
    let ConfigLoad { config, warnings } = ConfigLoader::with_options(ConfigLoaderOptions {
        config_path,
        env_file,
    })
    .load()
    .context("failed to load configuration")?;

    for warning in &warnings.items {
        match &warning.hint {
            Some(hint) => warn!(hint = %hint, "configuration warning: {}", warning.message),
            None => warn!("configuration warning: {}", warning.message),
        }
    }
    if let Some(path) = &config.metadata.config_path {
        info!(path = %path.display(), "configuration loaded");
    }

    Ok(config)
}

async fn run_server(config: &Config) -> anyhow::Result<()> {
    let service = HeraldService::connect(config).await?;
    service.start(config.ingest.topics.clone()).await?;
    info!("herald-server running; press Ctrl+C to stop");

    let shutdown = service.runtime().shutdown_token();
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for shutdown signal")?;
            info!("shutdown signal received");
        }
        _ = shutdown.cancelled() => {}
    }

    service.shutdown().await;
    Ok(())
}

async fn run_sweep(
    config: &Config,
    max_workers: Option<usize>,
) -> anyhow::Result<()> {
    let service = HeraldService::connect(config).await?;
    service.runtime().start().await;

    let workers = max_workers.unwrap_or(config.engine.sweep.max_workers);
    let report = service
        .runtime()
        .orchestrate_active(workers)
        .await
        .context("sweep failed");

    service.shutdown().await;
    let report = report?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn validate_formula(raw: &str) -> anyhow::Result<()> {
    let formula = Formula::compile(raw).with_context(|| format!("rejected formula {raw:?}"))?;
    match formula.column_order() {
        Some(order) => println!("ok: column formula, ORDER BY {order}"),
        None => println!("ok: expression formula"),
    }
    Ok(())
}
