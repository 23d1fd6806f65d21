//! # Tasker Queue Operator CLI
//!
//! Operator commands against a configured queue deployment: run the cleanup
//! sweeper, report transport state, and check configuration before rollout.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};

use tasker_session_queue::bootstrap::QueueSystem;
use tasker_session_queue::config::ConfigManager;
use tasker_session_queue::logging::init_structured_logging;

#[derive(Parser)]
#[command(name = "tasker-queue")]
#[command(about = "Operate a tasker session queue deployment")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Configuration file (default: TASKER_CONFIG_PATH or config/tasker-queue.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Force-close every existing conversation and clear the session registry
    Sweep {
        /// Endpoints closed per transaction (overrides sweeper.batch_size)
        #[arg(short, long)]
        batch_size: Option<usize>,
    },

    /// Show open endpoints and session registry rows
    Status,

    /// Load and validate configuration without connecting
    ValidateConfig,
}

#[tokio::main]
async fn main() {
    init_structured_logging();
    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Sweep { batch_size } => sweep(&cli, *batch_size).await,
        Commands::Status => status(&cli).await,
        Commands::ValidateConfig => validate_config(&cli),
    };

    if let Err(e) = result {
        error!(error = %format!("{e:#}"), "❌ CLI: Command failed");
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Arc<ConfigManager>> {
    let manager = match &cli.config {
        Some(path) => ConfigManager::load_from_file(Some(path.clone())),
        None => ConfigManager::load(),
    }
    .context("failed to load configuration")?;
    Ok(manager)
}

async fn connect(cli: &Cli) -> anyhow::Result<QueueSystem> {
    let manager = load_config(cli)?;
    QueueSystem::from_config(manager.config().clone())
        .await
        .context("failed to start queue system")
}

async fn sweep(cli: &Cli, batch_size: Option<usize>) -> anyhow::Result<()> {
    let mut config = load_config(cli)?.config().clone();
    if let Some(batch_size) = batch_size {
        config.sweeper.batch_size = batch_size;
    }
    let system = QueueSystem::from_config(config)
        .await
        .context("failed to start queue system")?;

    info!("🧹 CLI: Running cleanup sweep");
    let report = system.sweeper().sweep_all().await.context("sweep failed")?;

    match cli.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Table => {
            println!("🧹 Sweep complete");
            println!("  started at:        {}", report.started_at);
            println!("  batches:           {}", report.batches);
            println!("  endpoints closed:  {}", report.endpoints_closed);
            println!("  records deleted:   {}", report.records_deleted);
        }
    }
    Ok(())
}

async fn status(cli: &Cli) -> anyhow::Result<()> {
    let system = connect(cli).await?;
    let status = system.status().await.context("status query failed")?;

    match cli.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&status)?),
        OutputFormat::Table => {
            println!("📊 Transport: {}", status.transport);
            println!("  routes:          {}", status.routes.join(", "));
            println!("  open endpoints:  {}", status.open_endpoints);
            println!("  session records: {}", status.session_records.len());
            for record in &status.session_records {
                println!(
                    "    {:<24} local={} peer={}",
                    record.queue_name,
                    record.local_handle,
                    record
                        .peer_handle
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "-".to_string())
                );
            }
        }
    }
    Ok(())
}

fn validate_config(cli: &Cli) -> anyhow::Result<()> {
    let manager = load_config(cli)?;
    let config = manager.config();

    match cli.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&manager.sanitized())?),
        OutputFormat::Table => {
            println!("✅ Configuration valid");
            println!(
                "  source:     {}",
                manager
                    .source_path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "defaults + environment".to_string())
            );
            println!("  backend:    {}", config.transport.backend);
            println!("  strategy:   {:?}", config.lifecycle.default_strategy);
            println!("  workers:    {}", config.dispatcher.max_concurrent_workers);
            for route in &config.routes {
                println!(
                    "  route:      {} ({} -> {}, contract {}, replies on {})",
                    route.queue_name,
                    route.initiator_service,
                    route.target_service,
                    route.contract,
                    route.reply_queue()
                );
            }
        }
    }
    Ok(())
}
