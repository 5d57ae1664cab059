use crate::error::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Pipeline phase identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseId {
    Aggregate,
    Convert,
    Train,
    LocateCheckpoint,
    PublishCheckpoint,
    Notify,
}

impl PhaseId {
    pub const ORDER: [PhaseId; 6] = [
        PhaseId::Aggregate,
        PhaseId::Convert,
        PhaseId::Train,
        PhaseId::LocateCheckpoint,
        PhaseId::PublishCheckpoint,
        PhaseId::Notify,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseId::Aggregate => "aggregate",
            PhaseId::Convert => "convert",
            PhaseId::Train => "train",
            PhaseId::LocateCheckpoint => "locate_checkpoint",
            PhaseId::PublishCheckpoint => "publish_checkpoint",
            PhaseId::Notify => "notify",
        }
    }

    /// 1-based position in the pipeline
    pub fn number(&self) -> usize {
        Self::ORDER
            .iter()
            .position(|p| p == self)
            .map_or(0, |i| i + 1)
    }
}

impl std::fmt::Display for PhaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status as published in the status document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Queued,
    Running,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Idle => "idle",
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "idle" => Ok(RunStatus::Idle),
            "queued" => Ok(RunStatus::Queued),
            "running" => Ok(RunStatus::Running),
            "failed" => Ok(RunStatus::Failed),
            _ => Err(OrchestratorError::serialization(format!(
                "Invalid run status: {}",
                s
            ))),
        }
    }

    /// Idle -> Running -> {Idle, Failed}; Queued when the lock is busy
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Idle | Queued | Failed, Running)
                | (Idle | Queued | Failed, Queued)
                | (Running, Idle)
                | (Running, Failed)
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// In-process view of one run's lifecycle
#[derive(Debug, Clone)]
pub struct RunStateMachine {
    run_id: Uuid,
    status: RunStatus,
    phase: Option<PhaseId>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl Default for RunStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStateMachine {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            status: RunStatus::Idle,
            phase: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn current_phase(&self) -> Option<PhaseId> {
        self.phase
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    fn transition(&mut self, next: RunStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(OrchestratorError::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    /// Transition: * -> RUNNING
    pub fn start(&mut self, at: DateTime<Utc>) -> Result<()> {
        self.transition(RunStatus::Running)?;
        self.started_at = Some(at);
        self.finished_at = None;
        self.phase = None;
        Ok(())
    }

    /// Transition: * -> QUEUED (lock busy)
    pub fn queue(&mut self) -> Result<()> {
        self.transition(RunStatus::Queued)
    }

    /// Update current phase (running runs only)
    pub fn enter_phase(&mut self, phase: PhaseId) -> Result<()> {
        if self.status != RunStatus::Running {
            return Err(OrchestratorError::InvalidStateTransition {
                from: self.status.to_string(),
                to: format!("phase {}", phase),
            });
        }
        self.phase = Some(phase);
        Ok(())
    }

    /// Transition: RUNNING -> IDLE
    pub fn succeed(&mut self, at: DateTime<Utc>) -> Result<()> {
        self.transition(RunStatus::Idle)?;
        self.finished_at = Some(at);
        self.phase = None;
        Ok(())
    }

    /// Transition: RUNNING -> FAILED; the failed phase is kept
    pub fn fail(&mut self, at: DateTime<Utc>) -> Result<()> {
        self.transition(RunStatus::Failed)?;
        self.finished_at = Some(at);
        Ok(())
    }
}
