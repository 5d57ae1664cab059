/*
 * Retrain Orchestration - scheduled recommender retraining
 *
 * Runs the external data-prep and training commands, publishes the resulting
 * dataset and checkpoint as immutable versions, and keeps a status document
 * for the admin dashboard.
 *
 * Architecture:
 * - Step Runner (pluggable command executor)
 * - Pipeline Orchestrator (run state machine + phases, under the file lock)
 * - Artifact Publisher (versions + "current" pointers + manifests)
 * - Scheduler (fixed interval, no drift)
 * - Reload Notifier (best-effort HTTP)
 */

// Public modules
pub mod artifacts;
pub mod config;
pub mod error;
pub mod notifier;
pub mod orchestrator;
pub mod publish;
pub mod scheduler;
pub mod state;
pub mod status;
pub mod step;

// Re-exports
pub use artifacts::{CheckpointManifest, DatasetManifest, DatasetStats};
pub use config::PipelineConfig;
pub use error::{ErrorCategory, OrchestratorError, Result};
pub use notifier::{HttpReloadNotifier, NoopNotifier, ReloadNotifier};
pub use orchestrator::{PipelineOrchestrator, RunOutcome, RunReport, DATASET_DIR_ENV};
pub use publish::{ArtifactPublisher, DATASET_MANIFEST_NAME};
pub use scheduler::Scheduler;
pub use state::{PhaseId, RunStateMachine, RunStatus};
pub use status::StatusBoard;
pub use step::{CommandExecutor, ProcessExecutor, StepCommand};
