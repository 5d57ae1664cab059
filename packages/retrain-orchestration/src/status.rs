//! Aggregate run status document (`retrain_status.json`)
//!
//! Every transition is a partial update deep-merged by the manifest store,
//! except the embedded dataset/model manifests which are replaced whole so
//! that keys from an older version never linger.

use crate::artifacts::{CheckpointManifest, DatasetManifest};
use crate::error::{OrchestratorError, Result};
use crate::state::{PhaseId, RunStatus};
use chrono::{DateTime, Utc};
use retrain_storage::{iso, Clock, Document, ManifestStore};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

pub struct StatusBoard {
    manifests: Arc<ManifestStore>,
    clock: Arc<dyn Clock>,
    path: PathBuf,
}

impl StatusBoard {
    pub fn new(manifests: Arc<ManifestStore>, clock: Arc<dyn Clock>, path: impl Into<PathBuf>) -> Self {
        Self {
            manifests,
            clock,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> Result<Document> {
        Ok(self.manifests.read(&self.path)?)
    }

    /// Current lifecycle status, `None` before the first run
    pub fn status(&self) -> Result<Option<RunStatus>> {
        match self.read()?.get("status").and_then(Value::as_str) {
            Some(s) => RunStatus::from_str(s).map(Some),
            None => Ok(None),
        }
    }

    fn update(&self, update: Value) -> Result<()> {
        self.manifests.write(&self.path, update)?;
        Ok(())
    }

    pub fn run_started(&self, run_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        self.update(json!({
            "status": RunStatus::Running,
            "run_id": run_id.to_string(),
            "phase": null,
            "last_run_started_at": iso(at),
            "last_error": null,
            "last_error_kind": null,
            "failed_phase": null,
        }))
    }

    pub fn phase_started(&self, phase: PhaseId) -> Result<()> {
        self.update(json!({ "phase": phase }))
    }

    /// Success: back to idle with both manifests embedded
    pub fn run_succeeded(
        &self,
        at: DateTime<Utc>,
        dataset: &DatasetManifest,
        model: &CheckpointManifest,
    ) -> Result<()> {
        let mut doc = self.read()?;
        doc.insert(
            "dataset".to_string(),
            serde_json::to_value(dataset).map_err(OrchestratorError::serialization)?,
        );
        doc.insert(
            "model".to_string(),
            serde_json::to_value(model).map_err(OrchestratorError::serialization)?,
        );
        doc.insert("status".to_string(), json!(RunStatus::Idle));
        doc.insert("phase".to_string(), Value::Null);
        doc.insert("last_run_finished_at".to_string(), json!(iso(at)));
        doc.insert("last_success_at".to_string(), json!(iso(at)));
        doc.insert("updated_at".to_string(), Value::String(iso(self.clock.now())));

        self.manifests.replace(&self.path, &doc)?;
        Ok(())
    }

    /// Dataset published but the run is not over yet
    pub fn dataset_published(&self, dataset: &DatasetManifest) -> Result<()> {
        let mut doc = self.read()?;
        doc.insert(
            "dataset".to_string(),
            serde_json::to_value(dataset).map_err(OrchestratorError::serialization)?,
        );
        doc.insert("updated_at".to_string(), Value::String(iso(self.clock.now())));
        self.manifests.replace(&self.path, &doc)?;
        Ok(())
    }

    pub fn run_failed(
        &self,
        at: DateTime<Utc>,
        error: &OrchestratorError,
        phase: Option<PhaseId>,
    ) -> Result<()> {
        self.update(json!({
            "status": RunStatus::Failed,
            "last_run_finished_at": iso(at),
            "last_failure_at": iso(at),
            "last_error": error.to_string(),
            "last_error_kind": error.category(),
            "failed_phase": phase,
        }))
    }

    /// Lock was busy; nothing ran
    pub fn run_queued(&self, message: &str) -> Result<()> {
        self.update(json!({
            "status": RunStatus::Queued,
            "last_error": message,
            "last_error_kind": crate::error::ErrorCategory::Recoverable,
        }))
    }

    pub fn next_scheduled(&self, at: Option<DateTime<Utc>>) -> Result<()> {
        self.update(json!({ "next_scheduled_at": at.map(iso) }))
    }

    pub fn scheduler_started(&self, interval_seconds: u64, at: DateTime<Utc>) -> Result<()> {
        self.update(json!({
            "scheduler": {
                "active": true,
                "interval_seconds": interval_seconds,
                "started_at": iso(at),
                "stopped_at": null,
            }
        }))
    }

    pub fn scheduler_stopped(&self, at: DateTime<Utc>) -> Result<()> {
        self.update(json!({
            "scheduler": {
                "active": false,
                "stopped_at": iso(at),
            },
            "next_scheduled_at": null,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use retrain_storage::ManualClock;

    fn board(dir: &Path) -> (StatusBoard, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            DateTime::parse_from_rfc3339("2024-03-09T14:05:07Z")
                .unwrap()
                .with_timezone(&Utc),
        ));
        let manifests = Arc::new(ManifestStore::new(clock.clone()));
        (
            StatusBoard::new(manifests, clock.clone(), dir.join("retrain_status.json")),
            clock,
        )
    }

    fn dataset(version: &str, users: Option<usize>) -> DatasetManifest {
        DatasetManifest {
            version: version.to_string(),
            generated_at: "2024-03-09T14:05:07+00:00".to_string(),
            file: PathBuf::from(format!("versions/{}/ecommerce.inter", version)),
            rows: 10,
            users,
            items: None,
            positive_labels: None,
            source: vec![],
            header: vec![],
            current_link: PathBuf::from("current"),
        }
    }

    fn model(version: &str) -> CheckpointManifest {
        CheckpointManifest {
            version: version.to_string(),
            saved_at: "2024-03-09T14:05:07+00:00".to_string(),
            file: PathBuf::from(format!("versions/{}.pth", version)),
            source: "BERT4Rec-Mar-09-2024_14-05-07.pth".to_string(),
            current_link: PathBuf::from("current.pth"),
        }
    }

    #[test]
    fn test_start_clears_previous_error() {
        let dir = tempfile::tempdir().unwrap();
        let (board, clock) = board(dir.path());

        let err = OrchestratorError::publish("no checkpoint");
        board
            .run_failed(clock.now(), &err, Some(PhaseId::LocateCheckpoint))
            .unwrap();
        board.run_started(Uuid::new_v4(), clock.now()).unwrap();

        let doc = board.read().unwrap();
        assert_eq!(doc["status"], "running");
        assert_eq!(doc["last_error"], Value::Null);
        assert_eq!(doc["failed_phase"], Value::Null);
        assert!(doc.contains_key("last_failure_at"));
        assert_eq!(board.status().unwrap(), Some(RunStatus::Running));
    }

    #[test]
    fn test_success_replaces_embedded_manifests() {
        let dir = tempfile::tempdir().unwrap();
        let (board, clock) = board(dir.path());

        board
            .run_succeeded(clock.now(), &dataset("v1", Some(3)), &model("v1"))
            .unwrap();
        board
            .run_succeeded(clock.now(), &dataset("v2", None), &model("v2"))
            .unwrap();

        let doc = board.read().unwrap();
        assert_eq!(doc["status"], "idle");
        assert_eq!(doc["dataset"]["version"], "v2");
        assert!(doc["dataset"].get("users").is_none());
        assert_eq!(doc["model"]["version"], "v2");
        assert_eq!(doc["last_success_at"], "2024-03-09T14:05:07+00:00");
    }

    #[test]
    fn test_failure_records_kind_and_phase() {
        let dir = tempfile::tempdir().unwrap();
        let (board, clock) = board(dir.path());

        let err = OrchestratorError::StepFailure {
            command: "python3 train_bert4rec.py".to_string(),
            exit_code: Some(1),
            output: "KeyError: 'label'".to_string(),
        };
        board.run_failed(clock.now(), &err, Some(PhaseId::Train)).unwrap();

        let doc = board.read().unwrap();
        assert_eq!(doc["status"], "failed");
        assert_eq!(doc["last_error_kind"], "fatal");
        assert_eq!(doc["failed_phase"], "train");
        assert!(doc["last_error"].as_str().unwrap().contains("KeyError"));
    }

    #[test]
    fn test_scheduler_stop_clears_next_run() {
        let dir = tempfile::tempdir().unwrap();
        let (board, clock) = board(dir.path());

        board.scheduler_started(300, clock.now()).unwrap();
        board.next_scheduled(Some(clock.now())).unwrap();
        board.scheduler_stopped(clock.now()).unwrap();

        let doc = board.read().unwrap();
        assert_eq!(doc["scheduler"]["active"], false);
        assert_eq!(doc["scheduler"]["interval_seconds"], 300);
        assert_eq!(doc["next_scheduled_at"], Value::Null);
    }
}
