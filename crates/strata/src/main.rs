//! Strata daemon - consolidation loop with a stdin intake boundary

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use strata::config::Config;
use strata::error::{Result, StrataError};
use strata::intake::{ChunkBatch, Intake, IntakeMessage};
use strata::stats::StatsSnapshot;
use strata::tiers::{TierCoordinator, cancel_pair};
use strata::StrataContext;

/// Strata - tiered knowledge substrate
#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Tracks knowledge chunks through tiered memory stores")]
#[command(version)]
pub struct Cli {
    /// Path to config file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the consolidation loop and accept tagged JSON messages on stdin (default command)
    Run,
    /// Submit one batch file, run a sweep and print statistics
    Ingest {
        /// JSON file holding one chunk batch
        file: PathBuf,

        /// Print JSON instead of tables
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration
    CheckConfig,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let config = Config::load(cli.config)?;

    match cli.command {
        None | Some(Command::Run) => serve(config).await,
        Some(Command::Ingest { file, json }) => ingest(config, file, json).await,
        Some(Command::CheckConfig) => {
            let rendered = toml::to_string_pretty(&config)
                .map_err(|e| StrataError::Config(format!("Failed to render config: {e}")))?;
            println!("{rendered}");
            Ok(())
        }
    }
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,strata=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn serve(config: Config) -> Result<()> {
    info!("Starting strata daemon");
    debug!("Config loaded: {:?}", config);

    let ctx = StrataContext::from_config(config).await?;
    let coordinator = Arc::new(TierCoordinator::new(ctx.clone()));
    let intake = Intake::new(ctx);

    let (shutdown_handle, shutdown) = cancel_pair();
    let runner = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.run(shutdown).await })
    };

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Shutdown requested");
                break;
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => handle_line(&intake, &coordinator, &line).await,
                Ok(None) => {
                    info!("stdin closed; no further messages will be accepted");
                    stdin_open = false;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read stdin; intake stopped");
                    stdin_open = false;
                }
            },
        }
    }

    shutdown_handle.cancel();
    match runner.await {
        Ok(result) => result?,
        Err(e) => error!(error = %e, "Consolidation loop panicked"),
    }
    info!("Strata daemon stopped");
    Ok(())
}

/// One tagged JSON message per line (`batch`, `scores` or `status`); the
/// reply goes to stdout as one JSON line.
async fn handle_line(intake: &Intake, coordinator: &TierCoordinator, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let reply = match IntakeMessage::from_json(line) {
        Ok(message) => intake.route(coordinator, message).await,
        Err(e) => Err(e),
    };
    let output = match reply {
        Ok(reply) => serde_json::to_value(&reply),
        Err(e) => {
            warn!(error = %e, "Rejected message");
            Ok(serde_json::json!({
                "type": "error",
                "error": e.to_string(),
                "retryable": e.is_retryable(),
            }))
        }
    };
    match output {
        Ok(value) => println!("{value}"),
        Err(e) => error!(error = %e, "Failed to serialize receipt"),
    }
}

async fn ingest(config: Config, file: PathBuf, json: bool) -> Result<()> {
    let content = std::fs::read_to_string(&file).map_err(|e| {
        StrataError::Config(format!("Failed to read batch file {}: {}", file.display(), e))
    })?;
    let batch = ChunkBatch::from_json(&content)?;

    let ctx = StrataContext::from_config(config).await?;
    let coordinator = TierCoordinator::new(ctx.clone());
    let receipt = Intake::new(ctx.clone()).submit_batch(batch).await?;
    let report = coordinator.sweep().await?;
    let stats = StatsSnapshot::collect(&ctx).await?;

    if json {
        let output = serde_json::json!({
            "receipt": receipt,
            "sweep": report,
            "stats": stats,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!(
            "Batch {}: {} accepted, {} duplicate, {} rejected ({})",
            receipt.batch_id,
            receipt.status.accepted,
            receipt.status.duplicates,
            receipt.status.rejected,
            receipt.status.state
        );
        for rejected in receipt.rejected() {
            println!("  rejected: {}", serde_json::to_string(rejected)?);
        }
        println!();
        println!("{}", stats.render_table());
    }
    Ok(())
}
