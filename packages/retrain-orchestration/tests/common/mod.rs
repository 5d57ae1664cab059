//! Shared fakes for orchestrator and scheduler scenarios

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use retrain_orchestration::{
    CheckpointManifest, CommandExecutor, OrchestratorError, PipelineConfig, PipelineOrchestrator,
    ReloadNotifier, Result, StepCommand, DATASET_DIR_ENV,
};
use retrain_storage::{Clock, ManualClock};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Stands in for the Python scripts: writes what each real step would write
pub struct FakeExecutor {
    config: PipelineConfig,
    clock: ManualClock,
    train_duration: Duration,
    pub fail_train: AtomicBool,
    /// Convert exits 0 without writing anything
    pub silent_convert: AtomicBool,
    trains: AtomicUsize,
    cancel_after: Mutex<Option<(usize, CancellationToken)>>,
    pub aggregate_started: Mutex<Vec<DateTime<Utc>>>,
    pub train_finished: Mutex<Vec<DateTime<Utc>>>,
    pub dataset_dirs: Mutex<Vec<String>>,
}

impl FakeExecutor {
    pub fn new(config: &PipelineConfig, clock: &ManualClock, train_duration: Duration) -> Self {
        Self {
            config: config.clone(),
            clock: clock.clone(),
            train_duration,
            fail_train: AtomicBool::new(false),
            silent_convert: AtomicBool::new(false),
            trains: AtomicUsize::new(0),
            cancel_after: Mutex::new(None),
            aggregate_started: Mutex::new(Vec::new()),
            train_finished: Mutex::new(Vec::new()),
            dataset_dirs: Mutex::new(Vec::new()),
        }
    }

    /// Cancel `token` once `trains` training steps have run
    pub fn cancel_after(&self, trains: usize, token: CancellationToken) {
        *self.cancel_after.lock().unwrap() = Some((trains, token));
    }

    fn is(&self, command: &StepCommand, step: &StepCommand) -> bool {
        command.program == step.program && command.args == step.args
    }

    fn train(&self, run: usize) -> Result<String> {
        self.clock.advance(self.train_duration);
        self.train_finished.lock().unwrap().push(self.clock.now());

        if let Some((after, token)) = self.cancel_after.lock().unwrap().as_ref() {
            if run >= *after {
                token.cancel();
            }
        }

        if self.fail_train.load(Ordering::SeqCst) {
            return Err(OrchestratorError::StepFailure {
                command: "python3 train_bert4rec.py".to_string(),
                exit_code: Some(1),
                output: "RuntimeError: CUDA out of memory".to_string(),
            });
        }

        let out = &self.config.checkpoint.training_output_dir;
        std::fs::create_dir_all(out)?;
        for old in std::fs::read_dir(out)? {
            std::fs::remove_file(old?.path())?;
        }
        std::fs::write(
            out.join(format!("BERT4Rec-run-{}.pth", run)),
            format!("weights-{}", run),
        )?;
        Ok(format!("epoch 1 done (run {})", run))
    }
}

#[async_trait]
impl CommandExecutor for FakeExecutor {
    async fn run(&self, command: &StepCommand) -> Result<String> {
        let steps = &self.config.steps;
        if self.is(command, &steps.aggregate) {
            self.aggregate_started.lock().unwrap().push(self.clock.now());
            return Ok("aggregated".to_string());
        }
        if self.is(command, &steps.convert) {
            if self.silent_convert.load(Ordering::SeqCst) {
                return Ok(String::new());
            }
            let run = self.trains.load(Ordering::SeqCst) + 1;
            let staging = &self.config.dataset.staging_dir;
            std::fs::create_dir_all(staging)?;
            let mut body = String::from("user_id:token\titem_id:token\tlabel:float\n");
            for row in 0..run {
                body.push_str(&format!("u{}\t{}\t1\n", row, 100 + row));
            }
            std::fs::write(staging.join(&self.config.dataset.interactions_file), body)?;
            return Ok("converted".to_string());
        }
        if self.is(command, &steps.train) {
            if let Some(dir) = command.env.get(DATASET_DIR_ENV) {
                self.dataset_dirs.lock().unwrap().push(dir.clone());
            }
            let run = self.trains.fetch_add(1, Ordering::SeqCst) + 1;
            return self.train(run);
        }
        panic!("unexpected command {}", command.display());
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub seen: Mutex<Vec<CheckpointManifest>>,
}

#[async_trait]
impl ReloadNotifier for RecordingNotifier {
    async fn notify(&self, manifest: &CheckpointManifest) {
        self.seen.lock().unwrap().push(manifest.clone());
    }
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub config: PipelineConfig,
    pub clock: ManualClock,
    pub executor: Arc<FakeExecutor>,
    pub notifier: Arc<RecordingNotifier>,
    pub orchestrator: Arc<PipelineOrchestrator>,
}

impl Harness {
    pub fn new(configure: impl FnOnce(&mut PipelineConfig)) -> Self {
        Self::with_train_duration(Duration::from_secs(65), configure)
    }

    pub fn with_train_duration(
        train_duration: Duration,
        configure: impl FnOnce(&mut PipelineConfig),
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig::for_project_root(dir.path());
        configure(&mut config);

        let clock = ManualClock::starting_now();
        let executor = Arc::new(FakeExecutor::new(&config, &clock, train_duration));
        let notifier = Arc::new(RecordingNotifier::default());
        let orchestrator = Arc::new(PipelineOrchestrator::new(
            config.clone(),
            executor.clone(),
            notifier.clone(),
            Arc::new(clock.clone()),
        ));

        Self {
            dir,
            config,
            clock,
            executor,
            notifier,
            orchestrator,
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn status(&self) -> serde_json::Map<String, serde_json::Value> {
        self.orchestrator.status().read().unwrap()
    }
}

/// Non-hidden entries directly under `dir`
pub fn version_count(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
        .count()
}
