//! Session orchestrator.
//!
//! The [`ExperimentEngine`] owns the [`SessionQueue`] and drives one
//! [`TrialProtocol`] at a time. Operators talk to it only through an
//! [`EngineHandle`]: intents go in over an mpsc queue, progress comes back on
//! a broadcast channel.
//!
//! # Architecture
//!
//! ```text
//! EngineHandle ──ControlIntent──> ExperimentEngine ──advance()──> TrialProtocol
//!      ▲                               │                              │
//!      └──────ProgressNotification─────┘           display / audio / CameraHandle
//! ```
//!
//! Intents are checked once per refresh while a trial runs, so Pause and
//! Stop take effect within one refresh. Between refreshes nothing blocks.
//!
//! # Example
//!
//! ```rust,ignore
//! let (engine, handle) = ExperimentEngine::new(config, hardware, sink, layout);
//! let thread = engine.spawn_dedicated()?;
//! handle.send(ControlIntent::Start)?;
//! let summary = thread.join().expect("engine thread")?;
//! ```

use super::protocol::{AbortReason, Advance, TrialIo, TrialProtocol};
use super::queue::{SessionQueue, Trial, TrialId};
use super::state::{ExperimentState, ProgressCheckpoint, TrialSummary};
use super::timing::TrialTiming;
use crate::config::SessionConfig;
use crate::data::event_log::{EventKind, PersistenceSink, SessionEvent};
use crate::data::layout::SessionLayout;
use crate::error::{AppResult, SessionError};
use crate::hardware::capabilities::{AudioOutput, StimulusDisplay};
use crate::hardware::{CameraHandle, Clock, Cue, Instruction, ToneBuffer};
use crate::messages::{ControlIntent, ProgressNotification};
use chrono::Local;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Devices the engine drives.
pub struct SessionHardware {
    /// Stimulus surface; its refreshes pace the engine
    pub display: Box<dyn StimulusDisplay>,
    /// Beeps and spoken instructions
    pub audio: Arc<dyn AudioOutput>,
    /// Handle to the free-running capture loop
    pub camera: CameraHandle,
    /// Clock shared with the camera's frame source
    pub clock: Arc<dyn Clock>,
}

/// Final report of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub state: ExperimentState,
    pub completed: usize,
    pub total: usize,
    pub root: PathBuf,
}

/// Operator-side handle to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    intents: mpsc::Sender<ControlIntent>,
    progress: broadcast::Sender<ProgressNotification>,
    state: watch::Receiver<ExperimentState>,
}

impl EngineHandle {
    /// Queue an intent without blocking.
    pub fn send(&self, intent: ControlIntent) -> AppResult<()> {
        self.intents.try_send(intent).map_err(|e| match e {
            TrySendError::Full(_) => {
                SessionError::ChannelClosed(format!("intent queue is full, {} dropped", intent))
            }
            TrySendError::Closed(_) => {
                SessionError::ChannelClosed("experiment engine has exited".to_string())
            }
        })
    }

    /// Receive every notification from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressNotification> {
        self.progress.subscribe()
    }

    pub fn state(&self) -> ExperimentState {
        *self.state.borrow()
    }

    /// Resolve once the engine reaches a state matching `pred`.
    pub async fn wait_for(&self, pred: impl Fn(ExperimentState) -> bool) -> AppResult<ExperimentState> {
        let mut rx = self.state.clone();
        let state = rx
            .wait_for(|s| pred(*s))
            .await
            .map_err(|_| SessionError::ChannelClosed("experiment engine has exited".to_string()))?;
        Ok(*state)
    }
}

enum TrialOutcome {
    Completed,
    Stopped,
    Failed(SessionError),
}

enum Drive {
    Completed(TrialSummary),
    Paused,
    Stopped,
    Failed(SessionError),
}

enum Gate {
    Proceed,
    Stop,
}

/// Executes the session queue on its own context.
pub struct ExperimentEngine {
    config: SessionConfig,
    display: Box<dyn StimulusDisplay>,
    audio: Arc<dyn AudioOutput>,
    camera: CameraHandle,
    clock: Arc<dyn Clock>,
    sink: Box<dyn PersistenceSink>,
    layout: SessionLayout,
    queue: SessionQueue,
    intents: mpsc::Receiver<ControlIntent>,
    progress: broadcast::Sender<ProgressNotification>,
    state_tx: watch::Sender<ExperimentState>,
    state: ExperimentState,
    checkpoint: ProgressCheckpoint,
    ack_timeout: Duration,
}

impl ExperimentEngine {
    /// Create an engine for `config` and the handle that controls it.
    pub fn new(
        config: SessionConfig,
        hardware: SessionHardware,
        sink: Box<dyn PersistenceSink>,
        layout: SessionLayout,
    ) -> (Self, EngineHandle) {
        let (intent_tx, intent_rx) = mpsc::channel(config.engine.intent_capacity.max(1));
        let (progress_tx, _) = broadcast::channel(config.engine.progress_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(ExperimentState::Idle);
        let queue = SessionQueue::build(&config);
        let checkpoint = ProgressCheckpoint::new(Uuid::new_v4(), queue.total());
        let ack_timeout = Duration::from_millis(config.engine.ack_timeout_ms);

        let handle = EngineHandle {
            intents: intent_tx,
            progress: progress_tx.clone(),
            state: state_rx,
        };
        let engine = Self {
            config,
            display: hardware.display,
            audio: hardware.audio,
            camera: hardware.camera,
            clock: hardware.clock,
            sink,
            layout,
            queue,
            intents: intent_rx,
            progress: progress_tx,
            state_tx,
            state: ExperimentState::Idle,
            checkpoint,
            ack_timeout,
        };
        (engine, handle)
    }

    pub fn queue(&self) -> &SessionQueue {
        &self.queue
    }

    /// Run the engine on a dedicated OS thread with its own current-thread
    /// runtime, so stimulus timing never competes with other tasks.
    pub fn spawn_dedicated(self) -> AppResult<JoinHandle<AppResult<SessionSummary>>> {
        let thread = std::thread::Builder::new()
            .name("experiment-engine".to_string())
            .spawn(move || -> AppResult<SessionSummary> {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()?;
                runtime.block_on(self.run())
            })?;
        Ok(thread)
    }

    /// Execute the session until it completes, is stopped, or fails.
    ///
    /// # Errors
    ///
    /// - `HardwareUnavailable` / `ConfigValidation` from preflight, before any trial
    /// - the error that failed a trial (usually `RecordingFailure`), once the
    ///   operator sends Stop
    pub async fn run(mut self) -> AppResult<SessionSummary> {
        info!(
            session = %self.checkpoint.session_id,
            trials = self.queue.total(),
            root = ?self.layout.root(),
            "Experiment engine ready"
        );
        self.set_state(ExperimentState::Idle);

        // Idle admits only Start and Stop
        if self.next_intent().await != Some(ControlIntent::Start) {
            self.set_state(ExperimentState::Aborted);
            return Ok(self.summary());
        }

        self.set_state(ExperimentState::Preflight);
        let timing = match self.preflight() {
            Ok(timing) => timing,
            Err(e) => {
                error!("Preflight failed: {}", e);
                self.notify(ProgressNotification::Error {
                    message: e.to_string(),
                });
                self.set_state(ExperimentState::Error);
                return Err(e);
            }
        };

        let now = self.clock.now();
        self.sink.start_clock(now);
        self.log(SessionEvent::new(now, EventKind::SessionStart).with_detail(format!(
            "{} trials, {:.3} Hz",
            self.queue.total(),
            timing.refresh_hz
        )));
        self.notify_estimate();
        self.set_state(ExperimentState::Running);

        let mut first = true;
        while let Some(trial) = self.queue.next().cloned() {
            if !first && self.queue.starts_turn(trial.id) {
                if let Gate::Stop = self.await_confirmation(&trial).await {
                    return Ok(self.end_session(ExperimentState::Aborted));
                }
            }
            first = false;

            match self.run_trial(&trial, &timing).await {
                TrialOutcome::Completed => {}
                TrialOutcome::Stopped => return Ok(self.end_session(ExperimentState::Aborted)),
                TrialOutcome::Failed(e) => {
                    self.notify(ProgressNotification::Error {
                        message: e.to_string(),
                    });
                    self.end_session(ExperimentState::Error);
                    // Halted: only Stop (or a closed handle) ends the wait
                    let _ = self.next_intent().await;
                    return Err(e);
                }
            }
        }

        Ok(self.end_session(ExperimentState::Completed))
    }

    /// Check every device once and prepare the beeps.
    fn preflight(&mut self) -> AppResult<TrialTiming> {
        self.display
            .check()
            .map_err(|e| SessionError::HardwareUnavailable(format!("display: {e:#}")))?;
        self.audio
            .check()
            .map_err(|e| SessionError::HardwareUnavailable(format!("audio: {e:#}")))?;
        for (cue, tone) in [
            (Cue::StartBeep, ToneBuffer::start_beep(&self.config.audio)),
            (Cue::EndBeep, ToneBuffer::end_beep(&self.config.audio)),
        ] {
            self.audio
                .prepare(cue, tone)
                .map_err(|e| SessionError::HardwareUnavailable(format!("audio {:?}: {e:#}", cue)))?;
        }
        if let Some(fault) = self.camera.status().fault {
            return Err(SessionError::HardwareUnavailable(format!("camera: {}", fault)));
        }
        self.camera.start_preview().map_err(|e| match e {
            SessionError::ChannelClosed(why) => SessionError::HardwareUnavailable(format!("camera: {}", why)),
            other => other,
        })?;

        let refresh_hz = self.display.refresh_rate_hz();
        let timing = TrialTiming::from_config(&self.config, refresh_hz)?;
        info!(
            refresh_hz,
            trial_frames = timing.trial_frames(),
            recording_frames = timing.recording_frames,
            "Preflight passed"
        );
        Ok(timing)
    }

    /// Run one trial, replaying it after each pause until it ends.
    async fn run_trial(&mut self, trial: &Trial, timing: &TrialTiming) -> TrialOutcome {
        let post = self.post_instruction(trial.id);
        loop {
            self.queue.mark_running(trial.id);
            info!(trial = %trial.id, key = %trial.key, "Trial started");
            self.notify(ProgressNotification::TrialStarted {
                trial: trial.id,
                key: trial.key.clone(),
                position: self.queue.position(trial.id),
                total: self.queue.total(),
            });

            let mut protocol = TrialProtocol::new(trial, timing.clone(), post);
            match self.drive(&mut protocol).await {
                Drive::Completed(summary) => {
                    self.queue.mark_completed(trial.id);
                    if let Err(e) = self.persist(summary) {
                        error!(trial = %trial.id, "Cannot persist progress: {}", e);
                        return TrialOutcome::Failed(e);
                    }
                    self.notify_estimate();
                    return TrialOutcome::Completed;
                }
                Drive::Paused => {
                    self.queue.mark_interrupted(trial.id);
                    self.set_state(ExperimentState::Paused);
                    if self.next_intent().await == Some(ControlIntent::Resume) {
                        self.set_state(ExperimentState::Running);
                    } else {
                        self.queue.mark_stopped(trial.id);
                        return TrialOutcome::Stopped;
                    }
                }
                Drive::Stopped => {
                    self.queue.mark_stopped(trial.id);
                    return TrialOutcome::Stopped;
                }
                Drive::Failed(e) => {
                    self.queue.mark_failed(trial.id);
                    return TrialOutcome::Failed(e);
                }
            }
        }
    }

    /// Advance `protocol` refresh by refresh, checking intents before each one.
    async fn drive(&mut self, protocol: &mut TrialProtocol) -> Drive {
        let ack_timeout = self.ack_timeout;
        loop {
            loop {
                match self.intents.try_recv() {
                    Ok(intent) if !self.state.accepts(intent) => self.reject(intent),
                    Ok(ControlIntent::Pause) => {
                        self.abort(protocol, AbortReason::Paused).await;
                        return Drive::Paused;
                    }
                    Ok(ControlIntent::Stop) => {
                        self.abort(protocol, AbortReason::Stopped).await;
                        return Drive::Stopped;
                    }
                    Ok(other) => self.reject(other),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        warn!("Operator surface disconnected, stopping");
                        self.abort(protocol, AbortReason::Stopped).await;
                        return Drive::Stopped;
                    }
                }
            }

            let advanced = {
                let mut io = self.io();
                protocol.advance(&mut io).await
            };
            let failure = match advanced {
                Ok(Advance::Continue) => continue,
                Ok(Advance::Finished) => {
                    let finished = {
                        let mut io = self.io();
                        protocol.finish(&mut io, ack_timeout).await
                    };
                    match finished {
                        Ok(summary) => return Drive::Completed(summary),
                        Err(e) => e,
                    }
                }
                Err(e) => e,
            };

            let reason = failure.to_string();
            error!(trial = %protocol.trial(), phase = %protocol.phase(), "{}", reason);
            self.abort(protocol, AbortReason::Failed(reason)).await;
            return Drive::Failed(failure);
        }
    }

    async fn abort(&mut self, protocol: &mut TrialProtocol, reason: AbortReason) {
        let ack_timeout = self.ack_timeout;
        let mut io = self.io();
        protocol.abort(&mut io, reason, ack_timeout).await;
    }

    fn io(&mut self) -> TrialIo<'_> {
        TrialIo {
            display: self.display.as_mut(),
            audio: &self.audio,
            camera: &self.camera,
            sink: self.sink.as_mut(),
            progress: &self.progress,
            clock: self.clock.as_ref(),
            layout: &self.layout,
        }
    }

    /// Instruction closing a trial.
    fn post_instruction(&self, id: TrialId) -> Instruction {
        if self.queue.is_last(id) {
            Instruction::ExperimentCompleted
        } else if self.queue.is_last_in_turn(id) {
            Instruction::NextParticipant
        } else {
            Instruction::OpenYourEyes
        }
    }

    /// Hand a completed trial to persistence and write the checkpoint.
    ///
    /// Recoverable failures (I/O, serialization, event log) are reported and
    /// the session goes on; any other error halts it.
    fn persist(&mut self, summary: TrialSummary) -> AppResult<()> {
        if let Err(e) = self.sink.trial_finished(&summary) {
            if !e.is_recoverable() {
                return Err(e);
            }
            warn!("Trial summary write failed: {}", e);
        }
        self.checkpoint.record(summary);
        let path = self.layout.progress_path();
        match self.checkpoint.save(&path) {
            Ok(()) => info!(
                position = self.checkpoint.queue_position,
                total = self.checkpoint.total_trials,
                "Checkpoint saved"
            ),
            Err(e) if e.is_recoverable() => {
                error!(path = ?path, "Checkpoint write failed: {}", e);
                self.notify(ProgressNotification::Error {
                    message: format!("checkpoint write failed: {}", e),
                });
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    async fn await_confirmation(&mut self, next: &Trial) -> Gate {
        self.set_state(ExperimentState::WaitingConfirm);
        self.notify(ProgressNotification::AwaitingConfirmation {
            next_subject: next.key.subject.clone(),
        });
        if self.next_intent().await == Some(ControlIntent::ConfirmNext) {
            self.set_state(ExperimentState::Running);
            Gate::Proceed
        } else {
            Gate::Stop
        }
    }

    /// Next intent the current state accepts, rejecting the others on the
    /// way. `None` once every handle is gone.
    async fn next_intent(&mut self) -> Option<ControlIntent> {
        loop {
            let intent = self.intents.recv().await?;
            if self.state.accepts(intent) {
                return Some(intent);
            }
            self.reject(intent);
        }
    }

    fn end_session(&mut self, state: ExperimentState) -> SessionSummary {
        if let Err(e) = self.camera.stop_preview() {
            warn!("Could not stop camera preview: {}", e);
        }
        let now = self.clock.now();
        self.log(SessionEvent::new(now, EventKind::SessionEnd).with_detail(format!(
            "{} of {} trials completed",
            self.queue.completed(),
            self.queue.total()
        )));
        if let Err(e) = self.sink.flush() {
            warn!("Event log flush failed: {}", e);
        }
        self.set_state(state);
        self.summary()
    }

    fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.checkpoint.session_id,
            state: self.state,
            completed: self.queue.completed(),
            total: self.queue.total(),
            root: self.layout.root().to_path_buf(),
        }
    }

    fn reject(&self, intent: ControlIntent) {
        warn!(%intent, state = %self.state, "Intent rejected");
        self.notify(ProgressNotification::IntentRejected {
            intent,
            state: self.state,
        });
    }

    fn set_state(&mut self, state: ExperimentState) {
        if self.state != state {
            info!(from = %self.state, to = %state, "Engine state");
        }
        self.state = state;
        self.state_tx.send_replace(state);
        self.notify(ProgressNotification::StateChanged { state });
    }

    fn notify(&self, notification: ProgressNotification) {
        let _ = self.progress.send(notification);
    }

    fn notify_estimate(&self) {
        let remaining = self.queue.estimated_remaining(&self.config);
        let at = self.queue.estimated_end_time(&self.config, Local::now());
        self.notify(ProgressNotification::EstimatedEnd { at, remaining });
    }

    fn log(&mut self, event: SessionEvent) {
        if let Err(e) = self.sink.record_event(&event) {
            warn!(event = %event.kind, "Event log write failed: {}", e);
        }
    }
}
