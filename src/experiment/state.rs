//! Engine lifecycle state and progress checkpoints.
//!
//! A [`ProgressCheckpoint`] is written by the engine after every completed
//! trial and is the durable record of how far the session got.

use super::protocol::CycleRecord;
use super::queue::{TrialId, TrialKey};
use crate::error::AppResult;
use crate::messages::ControlIntent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use uuid::Uuid;

/// Engine lifecycle state.
///
/// # State Machine
///
/// ```text
/// Idle ──Start──> Preflight ──> Running ──queue done──> Completed
///                   │            │  ▲  │
///                   │       Pause│  │Resume
///                   │            ▼  │  │
///                   │           Paused │
///                   │                  │ turn end
///                   │                  ▼
///                   │            WaitingConfirm ──ConfirmNext──> Running
///                   ▼
///                 Error <── recording failure      Stop (any) ──> Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExperimentState {
    /// Waiting for Start
    Idle,
    /// Checking devices and preparing tones
    Preflight,
    /// A trial is executing
    Running,
    /// The current trial was interrupted and waits for Resume
    Paused,
    /// Between turns, waiting for ConfirmNext
    WaitingConfirm,
    /// Every trial completed
    Completed,
    /// Stopped by the operator
    Aborted,
    /// Halted by a hardware failure
    Error,
}

impl std::fmt::Display for ExperimentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExperimentState::Idle => write!(f, "Idle"),
            ExperimentState::Preflight => write!(f, "Preflight"),
            ExperimentState::Running => write!(f, "Running"),
            ExperimentState::Paused => write!(f, "Paused"),
            ExperimentState::WaitingConfirm => write!(f, "WaitingConfirm"),
            ExperimentState::Completed => write!(f, "Completed"),
            ExperimentState::Aborted => write!(f, "Aborted"),
            ExperimentState::Error => write!(f, "Error"),
        }
    }
}

impl ExperimentState {
    /// Check if the state allows starting the session.
    pub fn can_start(&self) -> bool {
        matches!(self, ExperimentState::Idle)
    }

    /// Check if the state allows pausing.
    pub fn can_pause(&self) -> bool {
        matches!(self, ExperimentState::Running)
    }

    /// Check if the state allows resuming.
    pub fn can_resume(&self) -> bool {
        matches!(self, ExperimentState::Paused)
    }

    /// Check if the state allows releasing the turn gate.
    pub fn can_confirm(&self) -> bool {
        matches!(self, ExperimentState::WaitingConfirm)
    }

    /// Whether `intent` is valid in this state.
    ///
    /// Stop is accepted until the session has ended, including while halted
    /// in `Error`, where it is the only way out.
    pub fn accepts(&self, intent: ControlIntent) -> bool {
        match intent {
            ControlIntent::Start => self.can_start(),
            ControlIntent::Pause => self.can_pause(),
            ControlIntent::Resume => self.can_resume(),
            ControlIntent::ConfirmNext => self.can_confirm(),
            ControlIntent::Stop => !matches!(self, ExperimentState::Completed | ExperimentState::Aborted),
        }
    }

    /// No further trials will run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExperimentState::Completed | ExperimentState::Aborted | ExperimentState::Error
        )
    }
}

/// Immutable result of a completed trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialSummary {
    /// Queue id
    pub id: TrialId,
    pub key: TrialKey,
    /// One Completed record per cycle, in order
    pub cycles: Vec<CycleRecord>,
}

/// Durable resume point, written only after a trial reaches Completed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressCheckpoint {
    /// Unique session identifier
    pub session_id: Uuid,
    /// Checkpoint creation timestamp
    pub timestamp: DateTime<Utc>,
    /// Trials completed so far, which is also the 0-based position of the
    /// next trial to run in an uninterrupted session
    pub queue_position: usize,
    pub total_trials: usize,
    /// Completed trials in completion order
    pub completed: Vec<TrialSummary>,
}

impl ProgressCheckpoint {
    pub fn new(session_id: Uuid, total_trials: usize) -> Self {
        Self {
            session_id,
            timestamp: Utc::now(),
            queue_position: 0,
            total_trials,
            completed: Vec::new(),
        }
    }

    /// Append a completed trial and advance the position.
    pub fn record(&mut self, summary: TrialSummary) {
        self.completed.push(summary);
        self.queue_position = self.completed.len();
        self.timestamp = Utc::now();
    }

    /// Save checkpoint to a JSON file.
    ///
    /// The file is written next to its destination and renamed into place,
    /// so readers never observe a partial checkpoint.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The parent directory cannot be created
    /// - Serialization fails
    /// - File write or rename fails
    pub fn save<P: AsRef<Path>>(&self, path: P) -> AppResult<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Load checkpoint from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}
