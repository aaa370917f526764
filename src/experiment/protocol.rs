//! Trial protocol state machine.
//!
//! One [`TrialProtocol`] executes one trial as a fixed list of steps, each a
//! whole number of display refreshes:
//!
//! ```text
//! Idle -> (TrainingPresent -> TrainingSilence) x training_repetitions
//!      -> [TrainingToMeasurementDelay]
//!      -> InstructionClose -> WaitPreEyes -> InstructionStart -> WaitPreMeasurement
//!      -> (CycleStartBeep -> [CycleRecordingDelay] -> CycleRecording
//!          -> CycleEndBeep -> [InterCycleDelay]) x cycles
//!      -> PostInstruction -> Completed
//! ```
//!
//! [`TrialProtocol::advance`] consumes exactly one refresh. Before waiting
//! for it, the actions of a step being entered are registered: the view is
//! drawn, beeps are attached to the refresh with `schedule_on_refresh`, and
//! camera start/stop commands are sent with the predicted onset time of that
//! refresh. After the refresh, onset events are logged with the refresh
//! timestamp and camera acknowledgments are polled without blocking.
//!
//! `Interrupted` and `Failed` are entered through [`TrialProtocol::abort`],
//! which discards every recording the trial produced.

use super::queue::{Trial, TrialId, TrialKey};
use super::state::TrialSummary;
use super::timing::TrialTiming;
use crate::data::event_log::{EventKind, EventStatus, PersistenceSink, SessionEvent};
use crate::data::layout::SessionLayout;
use crate::error::{AppResult, SessionError};
use crate::hardware::capabilities::{AudioOutput, StimulusDisplay};
use crate::hardware::{CameraHandle, Clock, Cue, Instruction, RefreshTick, StimulusView};
use crate::messages::{ProgressNotification, RecordingStarted, RecordingStopped};
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

/// Step of a trial. Subject-visible phases last a whole number of refreshes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrialPhase {
    /// Not started, or reset for a replay
    Idle,
    /// Shape shown, opened by a start beep
    TrainingPresent,
    /// Blank screen, opened by an end beep
    TrainingSilence,
    /// Optional blank gap before the instructions
    TrainingToMeasurementDelay,
    /// "Close your eyes" shown and spoken
    InstructionClose,
    WaitPreEyes,
    /// "Starting" shown and spoken
    InstructionStart,
    WaitPreMeasurement,
    /// Start beep of a cycle; its onset is the cycle's t0
    CycleStartBeep,
    /// Gap between the start beep and the camera start
    CycleRecordingDelay,
    /// Camera recording the cycle
    CycleRecording,
    /// End beep; the recording stops at its onset
    CycleEndBeep,
    InterCycleDelay,
    /// Open eyes, next participant, or experiment completed
    PostInstruction,
    /// Every cycle saved
    Completed,
    /// Paused or stopped; output discarded
    Interrupted,
    /// Hardware failure; output discarded
    Failed,
}

impl TrialPhase {
    /// Completed, Interrupted or Failed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TrialPhase::Completed | TrialPhase::Interrupted | TrialPhase::Failed
        )
    }
}

impl fmt::Display for TrialPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Lifecycle of one cycle recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleStatus {
    /// Start sent, stop not yet acknowledged
    Recording,
    /// File closed with enough frames
    Completed,
    /// File deleted with its trial
    Discarded,
}

/// One measurement cycle's recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleRecord {
    /// 1-based cycle index
    pub cycle: u32,
    /// Commanded start, replaced by the first recorded frame once acknowledged
    pub start: Duration,
    /// Timestamp of the first frame after the recording
    pub end: Option<Duration>,
    /// AVI file named after subject, shape, repetitions and cycle
    pub path: PathBuf,
    /// Frames written, known once the stop is acknowledged
    pub frames: Option<u32>,
    pub status: CycleStatus,
}

/// Collaborators a protocol drives, borrowed from the engine for one call.
pub struct TrialIo<'a> {
    /// Refresh-locked stimulus surface
    pub display: &'a mut dyn StimulusDisplay,
    pub audio: &'a Arc<dyn AudioOutput>,
    pub camera: &'a CameraHandle,
    /// Event log and cycle records
    pub sink: &'a mut dyn PersistenceSink,
    pub progress: &'a broadcast::Sender<ProgressNotification>,
    pub clock: &'a dyn Clock,
    /// Where recordings are written
    pub layout: &'a SessionLayout,
}

impl TrialIo<'_> {
    fn notify(&self, notification: ProgressNotification) {
        // No subscribers is fine
        let _ = self.progress.send(notification);
    }

    fn log(&mut self, event: SessionEvent) {
        if let Err(e) = self.sink.record_event(&event) {
            warn!(event = %event.kind, "Event log write failed: {}", e);
        }
    }
}

/// Result of one [`TrialProtocol::advance`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// A refresh was consumed
    Continue,
    /// Every step has run; call [`TrialProtocol::finish`]
    Finished,
}

/// Why a trial is abandoned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// Operator pause; the trial will be replayed
    Paused,
    /// Operator stop; the session ends
    Stopped,
    /// Hardware failure
    Failed(String),
}

#[derive(Debug, Clone, Copy)]
struct Step {
    phase: TrialPhase,
    cycle: Option<u32>,
    training_rep: Option<u32>,
    frames: u64,
}

enum PendingAck {
    Start {
        cycle: u32,
        rx: oneshot::Receiver<AppResult<RecordingStarted>>,
    },
    Stop {
        cycle: u32,
        rx: oneshot::Receiver<AppResult<RecordingStopped>>,
    },
}

/// Executes one trial, one refresh per [`advance`](Self::advance).
pub struct TrialProtocol {
    trial: TrialId,
    key: TrialKey,
    timing: TrialTiming,
    post: Instruction,
    steps: Vec<Step>,
    /// Index of the step shown by the most recent refresh
    current: Option<usize>,
    frames_left: u64,
    phase: TrialPhase,
    records: Vec<CycleRecord>,
    pending: Vec<PendingAck>,
    /// Events whose timestamp is the next refresh
    onsets: Vec<SessionEvent>,
    view_change: Option<StimulusView>,
    beep_onset: bool,
    entered: bool,
    beeps: u32,
    last_tick: Option<RefreshTick>,
    last_countdown: Option<u32>,
}

impl TrialProtocol {
    /// Protocol for `trial`, closing with the `post` instruction.
    pub fn new(trial: &Trial, timing: TrialTiming, post: Instruction) -> Self {
        let steps = Self::build_steps(&timing);
        Self {
            trial: trial.id,
            key: trial.key.clone(),
            timing,
            post,
            steps,
            current: None,
            frames_left: 0,
            phase: TrialPhase::Idle,
            records: Vec::new(),
            pending: Vec::new(),
            onsets: Vec::new(),
            view_change: None,
            beep_onset: false,
            entered: false,
            beeps: 0,
            last_tick: None,
            last_countdown: None,
        }
    }

    fn build_steps(timing: &TrialTiming) -> Vec<Step> {
        let mut steps = Vec::new();
        let mut push = |phase, cycle, training_rep, frames: u64| {
            if frames > 0 {
                steps.push(Step {
                    phase,
                    cycle,
                    training_rep,
                    frames,
                });
            }
        };

        for rep in 1..=timing.training_repetitions {
            push(TrialPhase::TrainingPresent, None, Some(rep), timing.shape_frames);
            push(TrialPhase::TrainingSilence, None, Some(rep), timing.blank_frames);
        }
        push(
            TrialPhase::TrainingToMeasurementDelay,
            None,
            None,
            timing.training_to_measurement_frames,
        );
        push(TrialPhase::InstructionClose, None, None, 1);
        push(TrialPhase::WaitPreEyes, None, None, timing.close_eyes_frames.saturating_sub(1));
        push(TrialPhase::InstructionStart, None, None, 1);
        push(
            TrialPhase::WaitPreMeasurement,
            None,
            None,
            timing.starting_frames.saturating_sub(1),
        );
        for cycle in 1..=timing.cycles {
            let c = Some(cycle);
            push(TrialPhase::CycleStartBeep, c, None, timing.start_beep_frames);
            push(TrialPhase::CycleRecordingDelay, c, None, timing.recording_delay_frames);
            push(TrialPhase::CycleRecording, c, None, timing.recording_frames);
            push(TrialPhase::CycleEndBeep, c, None, timing.end_beep_frames);
            if cycle < timing.cycles {
                push(TrialPhase::InterCycleDelay, c, None, timing.inter_cycle_frames);
            }
        }
        push(TrialPhase::PostInstruction, None, None, timing.post_instruction_frames);
        steps
    }

    /// Queue id of the trial being run.
    pub fn trial(&self) -> TrialId {
        self.trial
    }

    /// Subject, shape and repetitions of the trial.
    pub fn key(&self) -> &TrialKey {
        &self.key
    }

    /// Phase shown by the most recent refresh.
    pub fn phase(&self) -> TrialPhase {
        self.phase
    }

    /// Cycle of the current step, if any.
    pub fn cycle(&self) -> Option<u32> {
        self.current.and_then(|i| self.steps.get(i)).and_then(|s| s.cycle)
    }

    /// Cycle recordings started so far.
    pub fn records(&self) -> &[CycleRecord] {
        &self.records
    }

    /// Beeps played so far.
    pub fn beeps(&self) -> u32 {
        self.beeps
    }

    /// Refreshes an uninterrupted run takes.
    pub fn total_frames(&self) -> u64 {
        self.steps.iter().map(|s| s.frames).sum()
    }

    /// Consume one display refresh.
    ///
    /// # Errors
    /// `RecordingFailure` when the camera rejects a command or reports a
    /// failed recording, `HardwareUnavailable` when the display is lost.
    /// The caller must then [`abort`](Self::abort) the trial.
    pub async fn advance(&mut self, io: &mut TrialIo<'_>) -> AppResult<Advance> {
        if self.phase.is_terminal() {
            return Ok(Advance::Finished);
        }

        self.entered = false;
        if self.frames_left == 0 {
            let next = self.current.map_or(0, |i| i + 1);
            let Some(step) = self.steps.get(next).copied() else {
                return Ok(Advance::Finished);
            };
            self.current = Some(next);
            self.frames_left = step.frames;
            self.entered = true;
            self.enter(step, io)?;
        }

        let tick = io
            .display
            .wait_refresh()
            .await
            .map_err(|e| SessionError::HardwareUnavailable(format!("display refresh failed: {e:#}")))?;
        self.frames_left -= 1;
        self.on_refresh(tick, io);
        self.poll_acks(io)?;
        Ok(Advance::Continue)
    }

    /// Register the actions of `step` for the coming refresh.
    fn enter(&mut self, step: Step, io: &mut TrialIo<'_>) -> AppResult<()> {
        let key = self.key.clone();
        let event = |kind| SessionEvent::new(Duration::ZERO, kind).for_trial(&key);

        if self.phase == TrialPhase::Idle {
            self.onsets.push(event(EventKind::TrialStart).with_detail(format!(
                "{} cycles, post {}",
                self.timing.cycles,
                self.post.clip_name()
            )));
        }
        self.phase = step.phase;
        self.last_countdown = None;

        match step.phase {
            TrialPhase::TrainingPresent => {
                let rep = step.training_rep.unwrap_or(1);
                self.show(io, StimulusView::Shape(key.shape));
                self.schedule_cue(io, Cue::StartBeep);
                self.onsets.push(event(EventKind::TrainingStartBeep).with_detail(format!("training {}", rep)));
                self.onsets.push(event(EventKind::TrainingShapeOn).with_detail(format!("training {}", rep)));
            }
            TrialPhase::TrainingSilence => {
                let rep = step.training_rep.unwrap_or(1);
                self.show(io, StimulusView::Blank);
                self.schedule_cue(io, Cue::EndBeep);
                self.onsets.push(event(EventKind::TrainingEndBeep).with_detail(format!("training {}", rep)));
                self.onsets.push(event(EventKind::TrainingShapeOff).with_detail(format!("training {}", rep)));
            }
            TrialPhase::TrainingToMeasurementDelay => {
                self.show(io, StimulusView::Blank);
            }
            TrialPhase::InstructionClose => {
                self.instruct(io, Instruction::CloseYourEyes);
                self.onsets.push(event(EventKind::InstructionCloseEyes));
            }
            TrialPhase::InstructionStart => {
                self.instruct(io, Instruction::Starting);
                self.onsets.push(event(EventKind::InstructionStarting));
            }
            TrialPhase::CycleStartBeep => {
                let cycle = step.cycle.unwrap_or(1);
                self.show(io, StimulusView::Recording);
                self.schedule_cue(io, Cue::StartBeep);
                self.onsets.push(event(EventKind::ImaginationStartBeep).with_detail(format!("cycle {}", cycle)));
            }
            TrialPhase::CycleRecording => {
                let cycle = step.cycle.unwrap_or(1);
                let at = self.predicted_onset(io);
                let path = io.layout.recording_path(&key, cycle, Local::now());
                let rx = io
                    .camera
                    .start_recording(path.clone(), at, self.timing.recording_window())?;
                debug!(trial = %self.trial, cycle, at_ms = at.as_millis() as u64, "Camera start sent");
                self.pending.push(PendingAck::Start { cycle, rx });
                self.records.push(CycleRecord {
                    cycle,
                    start: at,
                    end: None,
                    path: path.clone(),
                    frames: None,
                    status: CycleStatus::Recording,
                });
                self.onsets.push(
                    event(EventKind::RecordingStart)
                        .with_detail(format!("cycle {} {}", cycle, path.display())),
                );
            }
            TrialPhase::CycleEndBeep => {
                let cycle = step.cycle.unwrap_or(1);
                let at = self.predicted_onset(io);
                let rx = io.camera.stop_recording(at)?;
                self.pending.push(PendingAck::Stop { cycle, rx });
                self.schedule_cue(io, Cue::EndBeep);
                self.onsets.push(event(EventKind::RecordingStop).with_detail(format!("cycle {}", cycle)));
                self.onsets.push(event(EventKind::ImaginationEndBeep).with_detail(format!("cycle {}", cycle)));
            }
            TrialPhase::PostInstruction => {
                self.instruct(io, self.post);
                let kind = match self.post {
                    Instruction::NextParticipant => EventKind::InstructionNextParticipant,
                    Instruction::ExperimentCompleted => EventKind::InstructionCompleted,
                    _ => EventKind::InstructionOpenEyes,
                };
                self.onsets.push(event(kind));
            }
            TrialPhase::WaitPreEyes
            | TrialPhase::WaitPreMeasurement
            | TrialPhase::CycleRecordingDelay
            | TrialPhase::InterCycleDelay => {}
            TrialPhase::Idle | TrialPhase::Completed | TrialPhase::Interrupted | TrialPhase::Failed => {}
        }
        Ok(())
    }

    fn show(&mut self, io: &mut TrialIo<'_>, view: StimulusView) {
        io.display.draw(view);
        self.view_change = Some(view);
    }

    fn schedule_cue(&mut self, io: &mut TrialIo<'_>, cue: Cue) {
        let audio = Arc::clone(io.audio);
        io.display.schedule_on_refresh(Box::new(move |tick: &RefreshTick| {
            if let Err(e) = audio.play(cue) {
                warn!(?cue, refresh = tick.index, "Beep playback failed: {e:#}");
            }
        }));
        self.beep_onset = true;
    }

    fn instruct(&mut self, io: &mut TrialIo<'_>, instruction: Instruction) {
        self.show(io, StimulusView::Instruction(instruction));
        let audio = Arc::clone(io.audio);
        io.display.schedule_on_refresh(Box::new(move |_tick: &RefreshTick| {
            if let Err(e) = audio.play_instruction(instruction) {
                warn!(clip = instruction.clip_name(), "Instruction playback failed: {e:#}");
            }
        }));
    }

    /// Session-clock time of the coming refresh.
    fn predicted_onset(&self, io: &TrialIo<'_>) -> Duration {
        let period = self.timing.frame_period();
        match self.last_tick {
            Some(tick) => tick.timestamp + period,
            None => io.clock.now() + period,
        }
    }

    fn on_refresh(&mut self, tick: RefreshTick, io: &mut TrialIo<'_>) {
        self.last_tick = Some(tick);

        for mut event in std::mem::take(&mut self.onsets) {
            event.timestamp = tick.timestamp;
            io.log(event);
        }

        if self.entered {
            let step = self.current.and_then(|i| self.steps.get(i)).copied();
            if let Some(step) = step {
                debug!(trial = %self.trial, phase = %step.phase, cycle = ?step.cycle, refresh = tick.index, "Phase entered");
                io.notify(ProgressNotification::PhaseChanged {
                    trial: self.trial,
                    phase: step.phase,
                    cycle: step.cycle,
                    duration: self.timing.duration_of(step.frames),
                });
            }
        }
        if let Some(view) = self.view_change.take() {
            io.notify(ProgressNotification::Stimulus(view));
        }
        if self.beep_onset {
            self.beep_onset = false;
            self.beeps += 1;
            io.notify(ProgressNotification::BeepProgress {
                current: self.beeps,
                total: self.timing.beeps_per_trial(),
            });
        }

        let seconds_left = (self.frames_left as f64 / self.timing.refresh_hz).ceil() as u32;
        if self.last_countdown != Some(seconds_left) {
            self.last_countdown = Some(seconds_left);
            io.notify(ProgressNotification::Countdown {
                phase: self.phase,
                seconds_left,
            });
        }
    }

    /// Handle every acknowledgment that has arrived.
    fn poll_acks(&mut self, io: &mut TrialIo<'_>) -> AppResult<()> {
        let mut still_pending = Vec::with_capacity(self.pending.len());
        for ack in std::mem::take(&mut self.pending) {
            match ack {
                PendingAck::Start { cycle, mut rx } => match rx.try_recv() {
                    Ok(result) => self.on_started(cycle, result, io)?,
                    Err(oneshot::error::TryRecvError::Empty) => {
                        still_pending.push(PendingAck::Start { cycle, rx })
                    }
                    Err(oneshot::error::TryRecvError::Closed) => return Err(lost_ack(cycle)),
                },
                PendingAck::Stop { cycle, mut rx } => match rx.try_recv() {
                    Ok(result) => self.on_stopped(cycle, result, io)?,
                    Err(oneshot::error::TryRecvError::Empty) => {
                        still_pending.push(PendingAck::Stop { cycle, rx })
                    }
                    Err(oneshot::error::TryRecvError::Closed) => return Err(lost_ack(cycle)),
                },
            }
        }
        self.pending = still_pending;
        Ok(())
    }

    fn on_started(
        &mut self,
        cycle: u32,
        result: AppResult<RecordingStarted>,
        io: &mut TrialIo<'_>,
    ) -> AppResult<()> {
        let started = result?;
        if let Some(record) = self.records.iter_mut().find(|r| r.cycle == cycle) {
            record.start = started.first_frame_at;
        }
        io.notify(ProgressNotification::RecordingStarted { path: started.path });
        Ok(())
    }

    fn on_stopped(
        &mut self,
        cycle: u32,
        result: AppResult<RecordingStopped>,
        io: &mut TrialIo<'_>,
    ) -> AppResult<()> {
        let stopped = result?;
        let Some(record) = self.records.iter_mut().find(|r| r.cycle == cycle) else {
            return Err(SessionError::RecordingFailure(format!(
                "stop acknowledged for unknown cycle {}",
                cycle
            )));
        };
        record.start = stopped.started_at;
        record.end = Some(stopped.stopped_at);
        record.frames = Some(stopped.frames);
        record.status = CycleStatus::Completed;
        info!(
            trial = %self.trial,
            cycle,
            frames = stopped.frames,
            span_ms = (stopped.stopped_at.saturating_sub(stopped.started_at)).as_millis() as u64,
            "Cycle recorded"
        );
        io.notify(ProgressNotification::RecordingSaved {
            path: stopped.path,
            frames: stopped.frames,
        });
        Ok(())
    }

    /// Wait for outstanding acknowledgments and close the trial.
    ///
    /// The trial is Completed only if every cycle has a saved recording.
    /// Cycle records are handed to the persistence sink here and nowhere
    /// else on the success path, so an aborted trial never logs a save.
    ///
    /// # Errors
    /// `RecordingFailure` if an acknowledgment fails, times out, or a cycle
    /// is missing. The caller must then [`abort`](Self::abort) the trial.
    pub async fn finish(&mut self, io: &mut TrialIo<'_>, ack_timeout: Duration) -> AppResult<TrialSummary> {
        for ack in std::mem::take(&mut self.pending) {
            match ack {
                PendingAck::Start { cycle, rx } => {
                    let result = await_ack(cycle, rx, ack_timeout).await?;
                    self.on_started(cycle, result, io)?;
                }
                PendingAck::Stop { cycle, rx } => {
                    let result = await_ack(cycle, rx, ack_timeout).await?;
                    self.on_stopped(cycle, result, io)?;
                }
            }
        }

        let complete = self.records.len() == self.timing.cycles as usize
            && self.records.iter().all(|r| r.status == CycleStatus::Completed);
        if !complete {
            return Err(SessionError::RecordingFailure(format!(
                "trial {} has {} of {} cycle recordings",
                self.trial,
                self.records.iter().filter(|r| r.status == CycleStatus::Completed).count(),
                self.timing.cycles
            )));
        }

        // Records reach persistence only once the whole trial has succeeded
        for record in &self.records {
            let at = record.end.unwrap_or(record.start);
            if let Err(e) = io.sink.cycle_finished(at, &self.key, record) {
                warn!(cycle = record.cycle, "Cycle log write failed: {}", e);
            }
        }
        self.phase = TrialPhase::Completed;
        io.log(
            SessionEvent::new(io.clock.now(), EventKind::TrialEnd)
                .for_trial(&self.key)
                .with_status(EventStatus::Completed),
        );
        io.notify(ProgressNotification::TrialCompleted { trial: self.trial });
        info!(trial = %self.trial, key = %self.key, "Trial completed");
        Ok(TrialSummary {
            id: self.trial,
            key: self.key.clone(),
            cycles: self.records.clone(),
        })
    }

    /// Abandon the trial: silence the subject, blank the screen, and delete
    /// every recording of this trial, including any in flight.
    pub async fn abort(&mut self, io: &mut TrialIo<'_>, reason: AbortReason, ack_timeout: Duration) {
        if self.phase.is_terminal() {
            return;
        }
        let phase = self.phase;
        match &reason {
            AbortReason::Failed(why) => warn!(trial = %self.trial, %phase, "Trial failed: {}", why),
            _ => info!(trial = %self.trial, %phase, ?reason, "Trial interrupted"),
        }

        io.audio.stop_all();
        io.display.draw(StimulusView::Blank);
        if let Err(e) = io.display.wait_refresh().await {
            warn!("Display refresh after abort failed: {e:#}");
        }
        io.notify(ProgressNotification::Stimulus(StimulusView::Blank));
        self.onsets.clear();
        self.pending.clear();

        let paths: Vec<PathBuf> = self.records.iter().map(|r| r.path.clone()).collect();
        match io.camera.discard(paths) {
            Ok(rx) => match tokio::time::timeout(ack_timeout, rx).await {
                Ok(Ok(report)) => {
                    for (path, why) in &report.failed {
                        warn!(path = ?path, "Could not delete recording: {}", why);
                    }
                    debug!(deleted = report.deleted.len(), "Trial recordings deleted");
                }
                Ok(Err(_)) => warn!("Camera dropped the discard request"),
                Err(_) => warn!(timeout_ms = ack_timeout.as_millis() as u64, "Discard timed out"),
            },
            Err(e) => warn!("Discard could not be sent: {}", e),
        }

        let now = io.clock.now();
        for record in &mut self.records {
            record.status = CycleStatus::Discarded;
        }
        for record in &self.records {
            if let Err(e) = io.sink.cycle_finished(now, &self.key, record) {
                warn!("Cycle log write failed: {}", e);
            }
            io.notify(ProgressNotification::RecordingDiscarded {
                path: record.path.clone(),
            });
        }

        let status = match reason {
            AbortReason::Failed(why) => {
                self.phase = TrialPhase::Failed;
                io.notify(ProgressNotification::TrialFailed {
                    trial: self.trial,
                    reason: why,
                });
                EventStatus::Failed
            }
            AbortReason::Paused | AbortReason::Stopped => {
                self.phase = TrialPhase::Interrupted;
                io.notify(ProgressNotification::TrialInterrupted { trial: self.trial });
                EventStatus::Interrupted
            }
        };
        io.log(
            SessionEvent::new(now, EventKind::TrialEnd)
                .for_trial(&self.key)
                .with_detail(format!("during {}", phase))
                .with_status(status),
        );
        if let Err(e) = io.sink.flush() {
            warn!("Event log flush failed: {}", e);
        }
    }
}

fn lost_ack(cycle: u32) -> SessionError {
    SessionError::RecordingFailure(format!(
        "camera dropped the acknowledgment for cycle {}",
        cycle
    ))
}

async fn await_ack<T>(
    cycle: u32,
    rx: oneshot::Receiver<AppResult<T>>,
    timeout: Duration,
) -> AppResult<AppResult<T>> {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(_)) => Err(lost_ack(cycle)),
        Err(_) => Err(SessionError::RecordingFailure(format!(
            "camera did not acknowledge cycle {} within {} ms",
            cycle,
            timeout.as_millis()
        ))),
    }
}
