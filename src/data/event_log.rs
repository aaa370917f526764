//! Event log and the persistence seam.
//!
//! The engine hands every timestamped event, cycle outcome and completed
//! trial to a [`PersistenceSink`]. [`CsvEventLog`] writes `event_log.csv`
//! with one flushed row per event:
//!
//! ```text
//! timestamp_s,elapsed_ms,event_type,subject,shape,rep,shape_rep,detail,status
//! 23.316667,23316.667,IMAGINATION_START_BEEP,Alice,circle,1,1,cycle 1,
//! ```
//!
//! `timestamp_s` is the session clock (refresh timestamps for stimulus
//! events), `elapsed_ms` is measured from [`PersistenceSink::start_clock`].

use crate::error::AppResult;
use crate::experiment::protocol::{CycleRecord, CycleStatus};
use crate::experiment::queue::TrialKey;
use crate::experiment::state::TrialSummary;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    SessionStart,
    TrialStart,
    TrainingStartBeep,
    TrainingShapeOn,
    TrainingEndBeep,
    TrainingShapeOff,
    InstructionCloseEyes,
    InstructionStarting,
    ImaginationStartBeep,
    RecordingStart,
    RecordingStop,
    ImaginationEndBeep,
    InstructionOpenEyes,
    InstructionNextParticipant,
    InstructionCompleted,
    RecordingSaved,
    RecordingDiscarded,
    TrialEnd,
    SessionEnd,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SessionStart => "SESSION_START",
            EventKind::TrialStart => "TRIAL_START",
            EventKind::TrainingStartBeep => "TRAINING_START_BEEP",
            EventKind::TrainingShapeOn => "TRAINING_SHAPE_ON",
            EventKind::TrainingEndBeep => "TRAINING_END_BEEP",
            EventKind::TrainingShapeOff => "TRAINING_SHAPE_OFF",
            EventKind::InstructionCloseEyes => "INSTRUCTION_CLOSE_EYES",
            EventKind::InstructionStarting => "INSTRUCTION_STARTING",
            EventKind::ImaginationStartBeep => "IMAGINATION_START_BEEP",
            EventKind::RecordingStart => "RECORDING_START",
            EventKind::RecordingStop => "RECORDING_STOP",
            EventKind::ImaginationEndBeep => "IMAGINATION_END_BEEP",
            EventKind::InstructionOpenEyes => "INSTRUCTION_OPEN_EYES",
            EventKind::InstructionNextParticipant => "INSTRUCTION_NEXT_PARTICIPANT",
            EventKind::InstructionCompleted => "INSTRUCTION_COMPLETED",
            EventKind::RecordingSaved => "RECORDING_SAVED",
            EventKind::RecordingDiscarded => "RECORDING_DISCARDED",
            EventKind::TrialEnd => "TRIAL_END",
            EventKind::SessionEnd => "SESSION_END",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome tag carried by closing events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventStatus {
    Completed,
    Interrupted,
    Discarded,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Completed => "Completed",
            EventStatus::Interrupted => "Interrupted",
            EventStatus::Discarded => "Discarded",
            EventStatus::Failed => "Failed",
        }
    }
}

/// One event-log entry.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    /// Session-clock time of the event
    pub timestamp: Duration,
    pub kind: EventKind,
    pub trial: Option<TrialKey>,
    pub detail: String,
    pub status: Option<EventStatus>,
}

impl SessionEvent {
    pub fn new(timestamp: Duration, kind: EventKind) -> Self {
        Self {
            timestamp,
            kind,
            trial: None,
            detail: String::new(),
            status: None,
        }
    }

    pub fn for_trial(mut self, key: &TrialKey) -> Self {
        self.trial = Some(key.clone());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn with_status(mut self, status: EventStatus) -> Self {
        self.status = Some(status);
        self
    }
}

/// Receiver of everything the session persists.
///
/// Called only from the engine context.
pub trait PersistenceSink: Send {
    /// Session-clock time at which the session started.
    fn start_clock(&mut self, _at: Duration) {}

    /// Append one event.
    fn record_event(&mut self, event: &SessionEvent) -> AppResult<()>;

    /// A cycle recording is final: saved once its trial completed, or
    /// discarded with an interrupted or failed trial.
    fn cycle_finished(&mut self, at: Duration, key: &TrialKey, record: &CycleRecord) -> AppResult<()>;

    /// A trial completed; its records are final.
    fn trial_finished(&mut self, summary: &TrialSummary) -> AppResult<()>;

    fn flush(&mut self) -> AppResult<()>;
}

const HEADER: [&str; 9] = [
    "timestamp_s",
    "elapsed_ms",
    "event_type",
    "subject",
    "shape",
    "rep",
    "shape_rep",
    "detail",
    "status",
];

/// `event_log.csv` writer.
pub struct CsvEventLog {
    path: PathBuf,
    writer: csv::Writer<File>,
    start: Option<Duration>,
}

impl CsvEventLog {
    /// Create the file and write the header.
    pub fn create<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut writer = csv::Writer::from_path(&path)?;
        writer.write_record(HEADER)?;
        writer.flush()?;
        debug!(path = ?path, "Event log created");
        Ok(Self {
            path,
            writer,
            start: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&mut self, event: &SessionEvent) -> AppResult<()> {
        let elapsed = self
            .start
            .map(|start| event.timestamp.saturating_sub(start).as_secs_f64() * 1000.0)
            .unwrap_or(0.0);
        let (subject, shape, rep, shape_rep) = match &event.trial {
            Some(key) => (
                key.subject.clone(),
                key.shape.to_string(),
                key.repetition.to_string(),
                key.shape_rep.to_string(),
            ),
            None => Default::default(),
        };
        self.writer.write_record([
            format!("{:.6}", event.timestamp.as_secs_f64()),
            format!("{:.3}", elapsed),
            event.kind.as_str().to_string(),
            subject,
            shape,
            rep,
            shape_rep,
            event.detail.clone(),
            event.status.map(|s| s.as_str().to_string()).unwrap_or_default(),
        ])?;
        self.writer.flush()?;
        Ok(())
    }
}

impl PersistenceSink for CsvEventLog {
    /// Reference time for `elapsed_ms`.
    fn start_clock(&mut self, at: Duration) {
        self.start = Some(at);
    }

    fn record_event(&mut self, event: &SessionEvent) -> AppResult<()> {
        self.write(event)
    }

    fn cycle_finished(&mut self, at: Duration, key: &TrialKey, record: &CycleRecord) -> AppResult<()> {
        let event = cycle_event(at, key, record);
        self.write(&event)
    }

    fn trial_finished(&mut self, _summary: &TrialSummary) -> AppResult<()> {
        self.flush()
    }

    fn flush(&mut self) -> AppResult<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Log row for a finished cycle.
fn cycle_event(at: Duration, key: &TrialKey, record: &CycleRecord) -> SessionEvent {
    let (kind, status) = match record.status {
        CycleStatus::Completed => (EventKind::RecordingSaved, EventStatus::Completed),
        CycleStatus::Recording | CycleStatus::Discarded => {
            (EventKind::RecordingDiscarded, EventStatus::Discarded)
        }
    };
    let mut detail = format!("cycle {} {}", record.cycle, record.path.display());
    if let Some(frames) = record.frames {
        detail.push_str(&format!(" frames={}", frames));
    }
    SessionEvent::new(at, kind)
        .for_trial(key)
        .with_detail(detail)
        .with_status(status)
}

/// In-memory sink for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub events: Vec<SessionEvent>,
    pub cycles: Vec<(TrialKey, CycleRecord)>,
    pub trials: Vec<TrialSummary>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Event kinds in order.
    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.iter().map(|e| e.kind).collect()
    }
}

impl PersistenceSink for MemorySink {
    fn record_event(&mut self, event: &SessionEvent) -> AppResult<()> {
        self.events.push(event.clone());
        Ok(())
    }

    fn cycle_finished(&mut self, at: Duration, key: &TrialKey, record: &CycleRecord) -> AppResult<()> {
        self.cycles.push((key.clone(), record.clone()));
        self.events.push(cycle_event(at, key, record));
        Ok(())
    }

    fn trial_finished(&mut self, summary: &TrialSummary) -> AppResult<()> {
        self.trials.push(summary.clone());
        Ok(())
    }

    fn flush(&mut self) -> AppResult<()> {
        Ok(())
    }
}

/// Sink shared between the engine and an observer.
pub type SharedSink<S> = std::sync::Arc<parking_lot::Mutex<S>>;

impl<S: PersistenceSink> PersistenceSink for SharedSink<S> {
    fn start_clock(&mut self, at: Duration) {
        self.lock().start_clock(at)
    }

    fn record_event(&mut self, event: &SessionEvent) -> AppResult<()> {
        self.lock().record_event(event)
    }

    fn cycle_finished(&mut self, at: Duration, key: &TrialKey, record: &CycleRecord) -> AppResult<()> {
        self.lock().cycle_finished(at, key, record)
    }

    fn trial_finished(&mut self, summary: &TrialSummary) -> AppResult<()> {
        self.lock().trial_finished(summary)
    }

    fn flush(&mut self) -> AppResult<()> {
        self.lock().flush()
    }
}
