//! Fixed-interval retraining loop.
//!
//! The next run is always `finish + interval`, measured after the previous
//! run returns, so a slow run neither triggers an immediate rerun nor shifts
//! later runs. Waiting happens in bounded chunks so cancellation is seen
//! promptly; a run that has started is never interrupted.

use crate::orchestrator::{PipelineOrchestrator, RunOutcome};
use chrono::{DateTime, Utc};
use retrain_storage::{Clock, LockWait};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const DEFAULT_SLEEP_CHUNK: Duration = Duration::from_secs(30);

pub struct Scheduler {
    orchestrator: Arc<PipelineOrchestrator>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    sleep_chunk: Duration,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<PipelineOrchestrator>, interval: Duration) -> Self {
        let clock = orchestrator.clock().clone();
        Self {
            orchestrator,
            clock,
            interval,
            sleep_chunk: DEFAULT_SLEEP_CHUNK,
        }
    }

    pub fn with_sleep_chunk(mut self, chunk: Duration) -> Self {
        if !chunk.is_zero() {
            self.sleep_chunk = chunk;
        }
        self
    }

    /// Run until `shutdown` is cancelled; returns the number of runs started
    pub async fn run_loop(&self, shutdown: CancellationToken) -> usize {
        let status = self.orchestrator.status();
        if let Err(e) = status.scheduler_started(self.interval.as_secs(), self.clock.now()) {
            warn!("Failed to record scheduler start: {}", e);
        }
        info!(
            "Retraining scheduler started (every {}s)",
            self.interval.as_secs()
        );

        let mut runs = 0;
        let mut next_run = self.clock.now();
        loop {
            if let Err(e) = status.next_scheduled(Some(next_run)) {
                warn!("Failed to record next scheduled run: {}", e);
            }
            if !self.wait_until(next_run, &shutdown).await {
                break;
            }

            runs += 1;
            let outcome = self.orchestrator.run_once(LockWait::Forever, "scheduler").await;
            match &outcome {
                RunOutcome::Succeeded(_) | RunOutcome::Queued(_) => {}
                RunOutcome::Failed { .. } => {
                    warn!("Scheduled run exited with code {}", outcome.exit_code())
                }
            }

            let finished = self.clock.now();
            next_run = chrono::Duration::from_std(self.interval)
                .ok()
                .and_then(|interval| finished.checked_add_signed(interval))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
        }

        let stopped = self.clock.now();
        if let Err(e) = status.scheduler_stopped(stopped) {
            warn!("Failed to record scheduler stop: {}", e);
        }
        info!("Retraining scheduler stopped after {} runs", runs);
        runs
    }

    /// Sleep in chunks until `deadline`; `false` if cancelled first
    async fn wait_until(&self, deadline: DateTime<Utc>, shutdown: &CancellationToken) -> bool {
        loop {
            if shutdown.is_cancelled() {
                return false;
            }
            let remaining = match (deadline - self.clock.now()).to_std() {
                Ok(remaining) if !remaining.is_zero() => remaining,
                // Negative or zero: due now
                _ => return true,
            };
            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = self.clock.sleep(remaining.min(self.sleep_chunk)) => {}
            }
        }
    }
}
