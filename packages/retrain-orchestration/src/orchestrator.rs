use crate::artifacts::{CheckpointManifest, DatasetManifest};
use crate::config::PipelineConfig;
use crate::error::{OrchestratorError, Result};
use crate::notifier::{HttpReloadNotifier, ReloadNotifier};
use crate::publish::ArtifactPublisher;
use crate::state::{PhaseId, RunStateMachine, RunStatus};
use crate::status::StatusBoard;
use crate::step::{CommandExecutor, ProcessExecutor};
use chrono::{DateTime, Utc};
use retrain_storage::{Clock, LockManager, LockWait, ManifestStore, SystemClock};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Environment variable naming the published dataset for the training step
pub const DATASET_DIR_ENV: &str = "RETRAIN_DATASET_DIR";

/// Result of one successful run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dataset: DatasetManifest,
    pub model: CheckpointManifest,
}

impl RunReport {
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

#[derive(Debug)]
pub enum RunOutcome {
    Succeeded(RunReport),
    Failed {
        error: OrchestratorError,
        phase: Option<PhaseId>,
    },
    /// Lock busy; nothing ran
    Queued(String),
}

impl RunOutcome {
    /// Process exit code: 0 success, 1 failure, 2 lock unavailable
    pub fn exit_code(&self) -> u8 {
        match self {
            RunOutcome::Succeeded(_) => 0,
            RunOutcome::Failed { error, .. } => error.category().exit_code().max(1),
            RunOutcome::Queued(_) => 2,
        }
    }
}

/// Sequences the retraining phases under the pipeline lock
pub struct PipelineOrchestrator {
    config: PipelineConfig,
    executor: Arc<dyn CommandExecutor>,
    notifier: Arc<dyn ReloadNotifier>,
    clock: Arc<dyn Clock>,
    locks: LockManager,
    status: StatusBoard,
    publisher: ArtifactPublisher,
}

impl PipelineOrchestrator {
    pub fn new(
        config: PipelineConfig,
        executor: Arc<dyn CommandExecutor>,
        notifier: Arc<dyn ReloadNotifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let manifests = Arc::new(ManifestStore::new(clock.clone()));
        let locks = LockManager::new(config.lock_config(), manifests.clone(), clock.clone());
        let status = StatusBoard::new(manifests.clone(), clock.clone(), &config.status_path);
        let publisher = ArtifactPublisher::new(
            config.dataset.clone(),
            config.checkpoint.clone(),
            config.pointer_kind,
            manifests,
            clock.clone(),
        );

        Self {
            config,
            executor,
            notifier,
            clock,
            locks,
            status,
            publisher,
        }
    }

    /// Real processes, HTTP reload and the system clock
    pub fn from_config(config: PipelineConfig) -> Result<Self> {
        let executor = Arc::new(ProcessExecutor::with_timeout(config.step_timeout()));
        let notifier = Arc::new(HttpReloadNotifier::new(&config.reload)?);
        Ok(Self::new(config, executor, notifier, SystemClock::shared()))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn status(&self) -> &StatusBoard {
        &self.status
    }

    pub fn publisher(&self) -> &ArtifactPublisher {
        &self.publisher
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Acquire the lock, run every phase, record the outcome, release.
    ///
    /// Never returns an error: failures are reported through the outcome and
    /// the status document.
    pub async fn run_once(&self, wait: LockWait, context: &str) -> RunOutcome {
        let mut machine = RunStateMachine::new();

        let guard = match self.locks.acquire(wait, context).await {
            Ok(guard) => guard,
            Err(e) => {
                let error = OrchestratorError::from(e);
                return match error {
                    OrchestratorError::LockTimeout(message) => {
                        warn!("Another retraining process is currently running: {}", message);
                        if let Err(e) = machine.queue() {
                            warn!("{}", e);
                        }
                        if let Err(e) = self.status.run_queued(&message) {
                            warn!("Failed to record queued status: {}", e);
                        }
                        RunOutcome::Queued(message)
                    }
                    error => self.record_failure(&machine, error),
                };
            }
        };

        let outcome = match self.execute_pipeline(&mut machine).await {
            Ok(report) => {
                info!(
                    "Retraining completed in {}s | dataset={} | model={}",
                    report.duration().num_seconds(),
                    report.dataset.version,
                    report.model.version
                );
                RunOutcome::Succeeded(report)
            }
            Err(error) => {
                if machine.status() == RunStatus::Running {
                    if let Err(e) = machine.fail(self.clock.now()) {
                        warn!("{}", e);
                    }
                }
                self.record_failure(&machine, error)
            }
        };

        if let Err(e) = guard.release() {
            warn!("Failed to release pipeline lock: {}", e);
        }
        outcome
    }

    fn record_failure(&self, machine: &RunStateMachine, error: OrchestratorError) -> RunOutcome {
        let phase = machine.current_phase();
        let at = machine.finished_at().unwrap_or_else(|| self.clock.now());
        error!(
            "Retraining pipeline failed{}: {}",
            phase.map(|p| format!(" in phase {}", p)).unwrap_or_default(),
            error
        );
        if let Err(e) = self.status.run_failed(at, &error, phase) {
            warn!("Failed to record failure status: {}", e);
        }
        RunOutcome::Failed { error, phase }
    }

    async fn execute_pipeline(&self, machine: &mut RunStateMachine) -> Result<RunReport> {
        let started = self.clock.now();
        machine.start(started)?;
        self.status.run_started(machine.run_id(), started)?;
        info!("Retraining run {} started", machine.run_id());

        let keep = self.config.keep_versions;
        let steps = &self.config.steps;

        self.enter(machine, PhaseId::Aggregate)?;
        self.executor.run(&steps.aggregate).await?;

        self.enter(machine, PhaseId::Convert)?;
        self.publisher.reset_staging()?;
        self.executor.run(&steps.convert).await?;
        let dataset = self.publisher.publish_dataset(keep)?;
        self.status.dataset_published(&dataset)?;

        self.enter(machine, PhaseId::Train)?;
        let dataset_dir = self.publisher.dataset_pointer().resolve()?.ok_or_else(|| {
            OrchestratorError::publish("dataset pointer vanished before training")
        })?;
        let train = steps
            .train
            .clone()
            .with_env(DATASET_DIR_ENV, dataset_dir.to_string_lossy());
        self.executor.run(&train).await?;

        self.enter(machine, PhaseId::LocateCheckpoint)?;
        let checkpoint = self.publisher.latest_checkpoint()?;

        self.enter(machine, PhaseId::PublishCheckpoint)?;
        let model = self.publisher.publish_checkpoint(&checkpoint, keep)?;

        self.enter(machine, PhaseId::Notify)?;
        self.notifier.notify(&model).await;

        let finished = self.clock.now();
        machine.succeed(finished)?;
        self.status.run_succeeded(finished, &dataset, &model)?;

        Ok(RunReport {
            run_id: machine.run_id(),
            started_at: started,
            finished_at: finished,
            dataset,
            model,
        })
    }

    fn enter(&self, machine: &mut RunStateMachine, phase: PhaseId) -> Result<()> {
        machine.enter_phase(phase)?;
        info!(
            "[{}/{}] {}",
            phase.number(),
            PhaseId::ORDER.len(),
            phase
        );
        self.status.phase_started(phase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::StepCommand;
    use async_trait::async_trait;
    use retrain_storage::{ManualClock, PointerKind};
    use std::time::Duration;

    /// Succeeds for every step, producing the files the real scripts would
    struct ScriptedExecutor {
        config: PipelineConfig,
        fail_program: Option<&'static str>,
    }

    #[async_trait]
    impl CommandExecutor for ScriptedExecutor {
        async fn run(&self, command: &StepCommand) -> Result<String> {
            if self.fail_program == command.args.first().map(String::as_str) {
                return Err(OrchestratorError::StepFailure {
                    command: command.display(),
                    exit_code: Some(1),
                    output: "boom".to_string(),
                });
            }
            if command == &self.config.steps.convert {
                let staging = &self.config.dataset.staging_dir;
                std::fs::create_dir_all(staging)?;
                std::fs::write(
                    staging.join(&self.config.dataset.interactions_file),
                    "user_id:token\titem_id:token\nu1\t1\n",
                )?;
            }
            if command.args == self.config.steps.train.args {
                let out = &self.config.checkpoint.training_output_dir;
                std::fs::create_dir_all(out)?;
                std::fs::write(out.join("BERT4Rec-run.pth"), b"weights")?;
            }
            Ok(String::new())
        }
    }

    fn orchestrator(
        dir: &std::path::Path,
        fail_program: Option<&'static str>,
    ) -> PipelineOrchestrator {
        let mut config = PipelineConfig::for_project_root(dir);
        config.pointer_kind = PointerKind::File;
        let executor = Arc::new(ScriptedExecutor {
            config: config.clone(),
            fail_program,
        });
        PipelineOrchestrator::new(
            config,
            executor,
            Arc::new(crate::notifier::NoopNotifier),
            Arc::new(ManualClock::starting_now()),
        )
    }

    #[tokio::test]
    async fn test_successful_run_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path(), None);

        let outcome = orch.run_once(LockWait::Immediate, "manual").await;

        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(orch.status().status().unwrap(), Some(RunStatus::Idle));
        assert!(!dir.path().join("log/retrain.lock").exists());
    }

    #[tokio::test]
    async fn test_aggregate_failure_stops_before_publishing() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path(), Some("user_behavior_advanced.py"));

        let outcome = orch.run_once(LockWait::Immediate, "manual").await;

        match &outcome {
            RunOutcome::Failed { phase, .. } => assert_eq!(*phase, Some(PhaseId::Aggregate)),
            other => panic!("Expected failure, got {:?}", other),
        }
        assert_eq!(outcome.exit_code(), 1);
        assert!(orch.publisher().dataset_pointer().resolve().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_busy_lock_is_queued() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path(), None);
        std::fs::create_dir_all(dir.path().join("log")).unwrap();
        std::fs::write(dir.path().join("log/retrain.lock"), "4242").unwrap();

        let outcome = orch
            .run_once(LockWait::Bounded(Duration::from_secs(3)), "manual")
            .await;

        assert!(matches!(outcome, RunOutcome::Queued(_)));
        assert_eq!(outcome.exit_code(), 2);
        let doc = orch.status().read().unwrap();
        assert_eq!(doc["status"], "queued");
        assert!(dir.path().join("log/retrain.lock").exists());
    }
}
