//! Pipeline configuration (defaults, YAML file, environment overrides)
//!
//! Precedence, lowest first: [`PipelineConfig::for_project_root`] defaults,
//! an optional YAML file, then environment variables. CLI flags are applied
//! by the binary on top of the result.

use crate::error::{OrchestratorError, Result};
use crate::step::StepCommand;
use retrain_storage::{LockConfig, PointerKind};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_INTERVAL: &str = "AI_RETRAIN_INTERVAL";
pub const ENV_KEEP_VERSIONS: &str = "AI_RETRAIN_KEEP_VERSIONS";
pub const ENV_LOCK_STALE_SECONDS: &str = "AI_RETRAIN_LOCK_STALE_SECONDS";
pub const ENV_RELOAD_URL: &str = "CHATBOT_RELOAD_URL";
pub const ENV_RELOAD_TOKEN: &str = "CHATBOT_RELOAD_TOKEN";
pub const ENV_RELOAD_TIMEOUT: &str = "CHATBOT_RELOAD_TIMEOUT";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub status_path: PathBuf,
    pub keep_versions: usize,
    /// Default `--timeout` for `--wait`
    pub lock_wait_seconds: u64,
    pub pointer_kind: PointerKind,
    pub steps: StepsConfig,
    pub dataset: DatasetConfig,
    pub checkpoint: CheckpointConfig,
    pub lock: LockSettings,
    pub reload: ReloadConfig,
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepsConfig {
    pub aggregate: StepCommand,
    pub convert: StepCommand,
    pub train: StepCommand,
    /// Unbounded when absent
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetConfig {
    /// Where the conversion step deposits its output
    pub staging_dir: PathBuf,
    /// Interactions file inside the staging dir used for statistics
    pub interactions_file: String,
    pub versions_dir: PathBuf,
    pub current: PathBuf,
    pub latest_manifest: PathBuf,
    #[serde(default)]
    pub sources: Vec<PathBuf>,
    /// Extra pointers at the published interactions file (paths older trainers read)
    #[serde(default)]
    pub file_links: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckpointConfig {
    pub training_output_dir: PathBuf,
    pub file_prefix: String,
    pub file_extension: String,
    pub versions_dir: PathBuf,
    pub current: PathBuf,
    pub latest_manifest: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LockSettings {
    pub path: PathBuf,
    pub stale_after_seconds: u64,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReloadConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleConfig {
    pub interval_seconds: u64,
    pub sleep_chunk_seconds: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::for_project_root(".")
    }
}

impl PipelineConfig {
    /// Standard layout of the recommender project rooted at `root`
    pub fn for_project_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let log_dir = root.join("log");
        let prep_dir = root.join("data").join("preprocessing");
        let raw_dir = root.join("data").join("raw");
        let dataset_dir = root.join("recommender").join("dataset");
        let training_dir = root.join("recommender").join("training");
        let serving_dir = root.join("recommender").join("saved");

        Self {
            status_path: log_dir.join("retrain_status.json"),
            keep_versions: 6,
            lock_wait_seconds: 60,
            pointer_kind: PointerKind::default(),
            steps: StepsConfig {
                aggregate: StepCommand::new("python3", ["user_behavior_advanced.py"], &prep_dir),
                convert: StepCommand::new(
                    "python3",
                    ["prepare_interactions_for_recbole.py"],
                    &prep_dir,
                ),
                train: StepCommand::new("python3", ["train_bert4rec.py"], &training_dir),
                timeout_seconds: None,
            },
            dataset: DatasetConfig {
                staging_dir: dataset_dir.join("staging"),
                interactions_file: "ecommerce.inter".to_string(),
                versions_dir: dataset_dir.join("versions"),
                current: dataset_dir.join("current"),
                latest_manifest: dataset_dir.join("latest_manifest.json"),
                sources: vec![
                    raw_dir.join("user_behavior_interactions.csv"),
                    raw_dir.join("interactions.csv"),
                ],
                file_links: vec![
                    dataset_dir.join("ecommerce.inter"),
                    dataset_dir.join("ecommerce").join("ecommerce.inter"),
                ],
            },
            checkpoint: CheckpointConfig {
                training_output_dir: training_dir.join("saved"),
                file_prefix: "BERT4Rec-".to_string(),
                file_extension: "pth".to_string(),
                versions_dir: serving_dir.join("versions"),
                current: serving_dir.join("current.pth"),
                latest_manifest: serving_dir.join("latest_model.json"),
            },
            lock: LockSettings {
                path: log_dir.join("retrain.lock"),
                stale_after_seconds: 5400,
                poll_interval_ms: 1000,
            },
            reload: ReloadConfig {
                url: Some("http://localhost:8008/internal/reload".to_string()),
                token: None,
                timeout_seconds: 10,
            },
            schedule: ScheduleConfig {
                interval_seconds: 300,
                sleep_chunk_seconds: 30,
            },
        }
    }

    /// Load a YAML file; missing keys keep the defaults
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| OrchestratorError::config(format!("{}: {}", path.display(), e)))?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(OrchestratorError::config)
    }

    /// Apply process environment overrides
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (testable)
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup(ENV_INTERVAL) {
            self.schedule.interval_seconds = parse_env(ENV_INTERVAL, &v)?;
        }
        if let Some(v) = lookup(ENV_KEEP_VERSIONS) {
            self.keep_versions = parse_env(ENV_KEEP_VERSIONS, &v)?;
        }
        if let Some(v) = lookup(ENV_LOCK_STALE_SECONDS) {
            self.lock.stale_after_seconds = parse_env(ENV_LOCK_STALE_SECONDS, &v)?;
        }
        if let Some(v) = lookup(ENV_RELOAD_URL) {
            let v = v.trim();
            self.reload.url = (!v.is_empty()).then(|| v.to_string());
        }
        if let Some(v) = lookup(ENV_RELOAD_TOKEN) {
            self.reload.token = (!v.is_empty()).then_some(v);
        }
        if let Some(v) = lookup(ENV_RELOAD_TIMEOUT) {
            self.reload.timeout_seconds = parse_env(ENV_RELOAD_TIMEOUT, &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.schedule.interval_seconds == 0 {
            return Err(OrchestratorError::config("schedule interval must be > 0"));
        }
        if self.schedule.sleep_chunk_seconds == 0 {
            return Err(OrchestratorError::config("sleep chunk must be > 0"));
        }
        if self.lock.stale_after_seconds == 0 {
            return Err(OrchestratorError::config(
                "lock staleness threshold must be > 0",
            ));
        }
        for (name, step) in [
            ("aggregate", &self.steps.aggregate),
            ("convert", &self.steps.convert),
            ("train", &self.steps.train),
        ] {
            if step.program.trim().is_empty() {
                return Err(OrchestratorError::config(format!(
                    "step '{}' has no program",
                    name
                )));
            }
        }
        if self.dataset.interactions_file.trim().is_empty() {
            return Err(OrchestratorError::config("dataset interactions_file is empty"));
        }
        Ok(())
    }

    pub fn lock_config(&self) -> LockConfig {
        let mut config = LockConfig::new(&self.lock.path, &self.status_path);
        config.stale_after = Duration::from_secs(self.lock.stale_after_seconds);
        config.poll_interval = Duration::from_millis(self.lock.poll_interval_ms);
        config
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        self.steps.timeout_seconds.map(Duration::from_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.schedule.interval_seconds)
    }

    pub fn sleep_chunk(&self) -> Duration {
        Duration::from_secs(self.schedule.sleep_chunk_seconds)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| OrchestratorError::config(format!("{}={:?}: {}", key, value, e)))
}
