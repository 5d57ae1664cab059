/*
 * Recommender retraining CLI
 *
 * Usage:
 *   retrain                      single run, fail at once if another run holds the lock
 *   retrain --wait --timeout 120 single run, wait up to 120s for the lock
 *   retrain --interval 300       scheduler mode, one run every 300s until Ctrl-C
 *
 * Exit codes: 0 success, 1 pipeline failure, 2 lock unavailable
 */

use anyhow::{Context, Result};
use clap::Parser;
use retrain_orchestration::{PipelineConfig, PipelineOrchestrator, RunOutcome, Scheduler};
use retrain_storage::LockWait;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Retrain the BERT4Rec recommender
#[derive(Parser, Debug)]
#[command(name = "retrain", version, about)]
struct Cli {
    /// Run the scheduler with this interval in seconds instead of a single run
    #[arg(long)]
    interval: Option<u64>,

    /// Number of dataset/model versions to keep (0 keeps everything)
    #[arg(long)]
    keep_versions: Option<usize>,

    /// Wait for a running retrain to finish instead of exiting with code 2
    #[arg(long)]
    wait: bool,

    /// Maximum seconds to wait for the lock in --wait mode
    #[arg(long)]
    timeout: Option<u64>,

    /// YAML configuration file (defaults derive from --project-root)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Root of the recommender project
    #[arg(long, default_value = ".")]
    project_root: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(1)
        }
    }
}

fn load_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::from_yaml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => PipelineConfig::for_project_root(&cli.project_root),
    };
    config.apply_env()?;

    if let Some(keep) = cli.keep_versions {
        config.keep_versions = keep;
    }
    if let Some(timeout) = cli.timeout {
        config.lock_wait_seconds = timeout;
    }
    if let Some(interval) = cli.interval.filter(|i| *i > 0) {
        config.schedule.interval_seconds = interval;
    }
    config.validate()?;
    Ok(config)
}

async fn run(cli: Cli) -> Result<u8> {
    let config = load_config(&cli)?;
    let interval = config.interval();
    let sleep_chunk = config.sleep_chunk();
    let lock_wait = Duration::from_secs(config.lock_wait_seconds);
    let keep = config.keep_versions;

    let orchestrator = Arc::new(PipelineOrchestrator::from_config(config)?);

    if cli.interval.map_or(false, |i| i > 0) {
        info!(
            "Starting scheduler mode (interval={}s, keep={})",
            interval.as_secs(),
            keep
        );
        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested, stopping after the current run");
                signal.cancel();
            }
        });

        Scheduler::new(orchestrator, interval)
            .with_sleep_chunk(sleep_chunk)
            .run_loop(shutdown)
            .await;
        return Ok(0);
    }

    let wait = if cli.wait {
        LockWait::from_timeout(Some(lock_wait))
    } else {
        LockWait::Immediate
    };
    info!("Starting single retraining run (lock wait {:?})", wait);

    let outcome = orchestrator.run_once(wait, "manual").await;
    if let RunOutcome::Succeeded(report) = &outcome {
        info!(
            "Run {} published dataset {} and model {}",
            report.run_id, report.dataset.version, report.model.version
        );
    }
    Ok(outcome.exit_code())
}
