//! CLI entry point for the harvester tool.

use std::io;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use harvester_core::events::JsonLinesSink;
use harvester_core::{EngineConfig, TaskRegistry, TaskStatus};
use tracing::{debug, info, warn};

mod cli;

use cli::Args;

/// Exit status of a run stopped with Ctrl-C.
const EXIT_CANCELLED: u8 = 130;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    // stdout carries the event stream, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => EngineConfig::load_default().context("loading default config")?,
    };
    args.apply_overrides(&mut config);
    config.validate().context("invalid configuration")?;

    let params = args.task_params(&config);
    let registry = TaskRegistry::builder(Arc::new(JsonLinesSink::new(io::stdout())))
        .config(config)
        .build()
        .context("starting task engine")?;
    let id = registry.create(params).context("submitting task")?;
    info!(task_id = %id, "harvester started");

    let interrupts = registry.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        info!("interrupt received, cancelling (press Ctrl-C again to force)");
        interrupts.cancel(id);
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("second interrupt, forcing cancellation");
            interrupts.cancel_with(id, true);
        }
    });

    let task = registry.wait(id).await.context("waiting for task")?;
    ctrl_c.abort();
    registry.shutdown().await;

    info!(
        status = %task.status,
        progress = task.progress,
        processed = task.stats.processed,
        errors = task.stats.errors,
        "harvester finished"
    );

    match task.status {
        TaskStatus::Completed => Ok(ExitCode::SUCCESS),
        TaskStatus::Cancelled => Ok(ExitCode::from(EXIT_CANCELLED)),
        _ => bail!(
            "task failed: {}",
            task.error.as_deref().unwrap_or("unknown error")
        ),
    }
}
