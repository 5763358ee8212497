//! attune command-line entry point.

use std::io::Read as _;
use std::path::PathBuf;

use anyhow::{Context as _, Result, bail};
use attune_core::config::AttuneConfig;
use attune_pipeline::backfill::backfill_embeddings;
use attune_pipeline::telemetry::init_tracing;
use attune_pipeline::{AttuneRuntime, ScanProgress};
use clap::{Parser, Subcommand};

// -----------------------------------------------------------------------------
// CLI structure
// -----------------------------------------------------------------------------

/// Personalized context injection for conversational assistants.
#[derive(Parser)]
#[command(name = "attune", author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to a TOML config file (defaults apply when omitted).
    #[arg(long, short, global = true, env = "ATTUNE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build the context block for a message and print the injected message.
    Inject {
        /// The message; read from stdin when omitted.
        message: Option<String>,
        /// Print the full per-stage result as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Scan provisional memories for conflicts and resolve them.
    Consolidate {
        /// Maximum candidates to scan (defaults to `consolidation.scan_limit`).
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Compute embeddings for memories that have none.
    Backfill {
        /// Records per provider call (defaults to `backfill.batch_size`).
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Verify the configured API key against the provider.
    CheckKey,
}

// -----------------------------------------------------------------------------
// Main
// -----------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => AttuneConfig::from_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => AttuneConfig::default(),
    };
    init_tracing(&config.general.log_level, config.general.json_logs)?;

    let runtime = AttuneRuntime::from_config(config)?;
    match cli.command {
        Command::Inject { message, json } => inject(&runtime, message, json).await,
        Command::Consolidate { limit } => consolidate(&runtime, limit).await,
        Command::Backfill { batch_size } => backfill(&runtime, batch_size).await,
        Command::CheckKey => check_key(&runtime).await,
    }
}

async fn inject(runtime: &AttuneRuntime, message: Option<String>, json: bool) -> Result<()> {
    let message = match message {
        Some(m) => m,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf).context("reading message from stdin")?;
            buf
        }
    };
    let pipeline = runtime.pipeline();
    let result = pipeline.build_context(&message, &[]).await;
    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("{}", attune_core::compose::prefix_message(&result.block, &message));
    }
    Ok(())
}

async fn consolidate(runtime: &AttuneRuntime, limit: Option<usize>) -> Result<()> {
    let limit = limit.unwrap_or(runtime.config.consolidation.scan_limit);
    let consolidator = runtime.consolidator();
    let progress: &(dyn Fn(ScanProgress) + Send + Sync) = &|p: ScanProgress| {
        eprintln!("[{}/{}] resolved {}", p.processed, p.total, p.resolved);
    };
    let report = consolidator.scan_and_consolidate(limit, Some(progress)).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.partial > 0 {
        bail!("{} resolution(s) were only partially applied", report.partial);
    }
    Ok(())
}

async fn backfill(runtime: &AttuneRuntime, batch_size: Option<usize>) -> Result<()> {
    let batch_size = batch_size.unwrap_or(runtime.config.backfill.batch_size);
    let budget = runtime.backfill_budget();
    let report = backfill_embeddings(
        &runtime.repo,
        runtime.embedder.as_ref(),
        &budget,
        batch_size,
        &runtime.metrics,
    )
    .await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn check_key(runtime: &AttuneRuntime) -> Result<()> {
    match runtime.client.verify_credential().await {
        Ok(()) => {
            println!("API key OK ({})", runtime.config.llm.base_url);
            Ok(())
        }
        Err(e) if e.is_credential() => bail!("API key rejected or missing: {e}"),
        Err(e) => bail!("could not verify API key: {e}"),
    }
}
