//! Message types for cross-context communication.
//!
//! The session runs on two long-lived contexts plus the operator surface:
//!
//! ```text
//! Operator surface                Engine context                 Camera thread
//! ----------------                --------------                 -------------
//! ControlIntent   --- mpsc --->   ExperimentEngine
//!                 <-- broadcast - ProgressNotification
//!                                 TrialProtocol  --- mpsc --->   CaptureLoop
//!                                                <-- oneshot --  acknowledgments
//! ```
//!
//! # Channel Types
//!
//! - **mpsc**: operator → engine intents, engine → camera commands. Senders
//!   use `try_send` so neither the operator surface nor the refresh-locked
//!   loop ever blocks on a full queue.
//! - **broadcast**: engine → any number of operator views.
//! - **oneshot**: one acknowledgment per camera command, polled by the engine
//!   once per refresh.
//!
//! # Helper Methods
//!
//! Each acknowledged camera command has a constructor returning the receiver:
//!
//! ```rust
//! use lsci_session::messages::CameraCommand;
//! use std::time::Duration;
//!
//! let (cmd, rx) = CameraCommand::stop_recording(Duration::from_secs(3));
//! // camera_tx.try_send(cmd)?;
//! // later: rx.try_recv()
//! # drop((cmd, rx));
//! ```

use crate::error::AppResult;
use crate::experiment::protocol::TrialPhase;
use crate::experiment::queue::{TrialId, TrialKey};
use crate::experiment::state::ExperimentState;
use crate::hardware::StimulusView;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::oneshot;

/// Operator requests to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlIntent {
    /// Begin pulling trials (valid only while Idle)
    Start,
    /// Interrupt the running trial; its output is discarded
    Pause,
    /// Restart the interrupted trial from its first step
    Resume,
    /// Release the gate between two turns
    ConfirmNext,
    /// End the session; not resumable
    Stop,
}

impl fmt::Display for ControlIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControlIntent::Start => "Start",
            ControlIntent::Pause => "Pause",
            ControlIntent::Resume => "Resume",
            ControlIntent::ConfirmNext => "ConfirmNext",
            ControlIntent::Stop => "Stop",
        };
        f.write_str(name)
    }
}

/// Push-only updates from the engine to the operator surface.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressNotification {
    StateChanged {
        state: ExperimentState,
    },
    TrialStarted {
        trial: TrialId,
        key: TrialKey,
        /// 1-based position in the queue
        position: usize,
        total: usize,
    },
    PhaseChanged {
        trial: TrialId,
        phase: TrialPhase,
        cycle: Option<u32>,
        duration: Duration,
    },
    /// Whole seconds left in the current phase
    Countdown {
        phase: TrialPhase,
        seconds_left: u32,
    },
    BeepProgress {
        current: u32,
        total: u32,
    },
    /// Mirror of what the subject sees
    Stimulus(StimulusView),
    RecordingStarted {
        path: PathBuf,
    },
    RecordingSaved {
        path: PathBuf,
        frames: u32,
    },
    RecordingDiscarded {
        path: PathBuf,
    },
    TrialCompleted {
        trial: TrialId,
    },
    TrialInterrupted {
        trial: TrialId,
    },
    TrialFailed {
        trial: TrialId,
        reason: String,
    },
    /// The next turn waits for [`ControlIntent::ConfirmNext`]
    AwaitingConfirmation {
        next_subject: String,
    },
    EstimatedEnd {
        at: DateTime<Local>,
        remaining: Duration,
    },
    IntentRejected {
        intent: ControlIntent,
        state: ExperimentState,
    },
    Error {
        message: String,
    },
}

/// Camera acknowledgment: the first recorded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingStarted {
    pub path: PathBuf,
    /// Timestamp of the first frame written
    pub first_frame_at: Duration,
}

/// Camera acknowledgment: a closed recording.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingStopped {
    pub path: PathBuf,
    pub frames: u32,
    /// Timestamp of the first frame written
    pub started_at: Duration,
    /// Timestamp of the first frame after the recording
    pub stopped_at: Duration,
    /// Frames the sensor lost inside the recording window
    pub dropped_frames: u64,
}

/// Result of a discard request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscardReport {
    /// Files removed from disk
    pub deleted: Vec<PathBuf>,
    /// Files that existed but could not be removed
    pub failed: Vec<(PathBuf, String)>,
}

/// Commands to the capture thread.
///
/// Start and stop carry the session-clock time at which they take effect;
/// the capture thread applies them to the first frame at or after that time,
/// so a command may be sent ahead of its boundary.
#[derive(Debug)]
pub enum CameraCommand {
    /// Route frames to the preview channel while not recording
    StartPreview,
    /// Drop frames while not recording
    StopPreview,
    /// Open `path` and record from the first frame at or after `at`.
    ///
    /// # Response
    /// - `Ok(RecordingStarted)` once the first frame is written
    /// - `Err(RecordingFailure)` if the file could not be created or the
    ///   sensor failed before the start
    StartRecording {
        path: PathBuf,
        at: Duration,
        /// Commanded window; shorter recordings after frame drops fail
        min_duration: Duration,
        response: oneshot::Sender<AppResult<RecordingStarted>>,
    },
    /// Close the active recording at the first frame at or after `at`.
    ///
    /// # Response
    /// - `Ok(RecordingStopped)` with the frame count
    /// - `Err(RecordingFailure)` on write errors, sensor failure, or too
    ///   many dropped frames
    StopRecording {
        at: Duration,
        response: oneshot::Sender<AppResult<RecordingStopped>>,
    },
    /// Immediately abandon any active or scheduled recording and delete
    /// the active file plus every listed path.
    Discard {
        paths: Vec<PathBuf>,
        response: oneshot::Sender<DiscardReport>,
    },
}

impl CameraCommand {
    /// Create a `StartRecording` command and its acknowledgment receiver.
    pub fn start_recording(
        path: PathBuf,
        at: Duration,
        min_duration: Duration,
    ) -> (Self, oneshot::Receiver<AppResult<RecordingStarted>>) {
        let (tx, rx) = oneshot::channel();
        let cmd = Self::StartRecording {
            path,
            at,
            min_duration,
            response: tx,
        };
        (cmd, rx)
    }

    /// Create a `StopRecording` command and its acknowledgment receiver.
    pub fn stop_recording(at: Duration) -> (Self, oneshot::Receiver<AppResult<RecordingStopped>>) {
        let (tx, rx) = oneshot::channel();
        (Self::StopRecording { at, response: tx }, rx)
    }

    /// Create a `Discard` command and its report receiver.
    pub fn discard(paths: Vec<PathBuf>) -> (Self, oneshot::Receiver<DiscardReport>) {
        let (tx, rx) = oneshot::channel();
        (Self::Discard { paths, response: tx }, rx)
    }
}
