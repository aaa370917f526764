//! End-to-end session tests on mock hardware in virtual time.
//!
//! The display advances a shared `SimClock` one refresh per tick and the mock
//! camera delivers frames against the same clock, so whole sessions run in
//! well under a second while keeping exact refresh and frame timestamps.

use chrono::Local;
use lsci_session::config::{SessionConfig, Shape};
use lsci_session::data::event_log::SharedSink;
use lsci_session::data::{CsvEventLog, EventKind, EventStatus, MemorySink, PersistenceSink, SessionLayout};
use lsci_session::experiment::{
    CycleStatus, EngineHandle, ExperimentEngine, ExperimentState, SessionHardware, SessionSummary,
    TrialId, TrialPhase,
};
use lsci_session::hardware::mock::{MockAudio, MockDisplay, MockFrameSource};
use lsci_session::hardware::{AudioOutput, CameraCoordinator, Clock, Cue, SimClock};
use lsci_session::messages::{ControlIntent, ProgressNotification};
use lsci_session::{AppResult, SessionError};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const REFRESH: Duration = Duration::from_millis(20);
const CAMERA_FRAME: Duration = Duration::from_millis(10);

/// 50 Hz display, 100 fps camera, 0.7 s recording window per cycle.
fn short_config(dir: &TempDir) -> SessionConfig {
    let mut config = SessionConfig::default();
    config.session.subjects = vec!["Alice".to_string()];
    config.session.shapes = vec![Shape::Circle, Shape::Square];
    config.session.output_base_dir = dir.path().to_path_buf();
    config.timing.training_repetitions = 1;
    config.timing.training_shape_duration = 0.2;
    config.timing.training_blank_duration = 0.2;
    config.timing.imagination_cycles = 2;
    config.timing.imagination_duration = 1.0;
    config.timing.recording_delay = 0.2;
    config.timing.inter_imagination_delay = 0.4;
    config.timing.close_eyes_wait = 0.2;
    config.timing.starting_wait = 0.2;
    config.timing.post_instruction_wait = 0.2;
    config.audio.start_beep_duration = 0.1;
    config.audio.end_beep_duration = 0.1;
    config.camera.width = 8;
    config.camera.height = 4;
    config.camera.target_fps = 100.0;
    config.display.refresh_rate_hz = 50.0;
    config.engine.progress_capacity = 16_384;
    config
}

struct Session {
    _dir: TempDir,
    root: PathBuf,
    audio: Arc<MockAudio>,
    handle: EngineHandle,
    progress: broadcast::Receiver<ProgressNotification>,
    task: JoinHandle<AppResult<SessionSummary>>,
    _camera: CameraCoordinator,
}

/// Build hardware, layout and engine, then spawn the engine.
///
/// `sink` receives the session layout so file-backed sinks can be created
/// inside the session directory.
fn start_session(
    dir: TempDir,
    config: SessionConfig,
    source: impl FnOnce(Arc<dyn Clock>) -> MockFrameSource,
    audio: impl FnOnce(MockAudio) -> MockAudio,
    sink: impl FnOnce(&SessionLayout) -> Box<dyn PersistenceSink>,
) -> Session {
    let clock = SimClock::new();
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    let camera = CameraCoordinator::spawn(Box::new(source(Arc::clone(&shared))), &config.camera)
        .expect("mock camera opens");
    let audio = Arc::new(audio(MockAudio::new(Arc::clone(&shared))));
    let audio_dyn: Arc<dyn AudioOutput> = audio.clone();
    let layout = SessionLayout::create(&config, Local::now()).expect("session directory");
    let root = layout.root().to_path_buf();
    let sink = sink(&layout);

    let hardware = SessionHardware {
        display: Box::new(MockDisplay::virtual_time(config.display.refresh_rate_hz, clock)),
        audio: audio_dyn,
        camera: camera.handle(),
        clock: shared,
    };
    let (engine, handle) = ExperimentEngine::new(config, hardware, sink, layout);
    let progress = handle.subscribe();
    let task = tokio::spawn(engine.run());

    Session {
        _dir: dir,
        root,
        audio,
        handle,
        progress,
        task,
        _camera: camera,
    }
}

fn memory_sink() -> (SharedSink<MemorySink>, impl FnOnce(&SessionLayout) -> Box<dyn PersistenceSink>) {
    let sink: SharedSink<MemorySink> = Arc::new(Mutex::new(MemorySink::new()));
    let for_engine = Arc::clone(&sink);
    (sink, move |_: &SessionLayout| Box::new(for_engine) as Box<dyn PersistenceSink>)
}

/// Receive until `pred` matches, skipping anything else.
async fn next_matching(
    rx: &mut broadcast::Receiver<ProgressNotification>,
    pred: impl Fn(&ProgressNotification) -> bool,
) -> ProgressNotification {
    loop {
        match rx.recv().await {
            Ok(n) if pred(&n) => return n,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => panic!("engine closed the progress channel"),
        }
    }
}

fn avi_files(dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|e| e == "avi") {
                found.push(path);
            }
        }
    }
    found.sort();
    found
}

#[tokio::test]
async fn full_session_records_every_cycle_with_exact_windows() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = short_config(&dir);
    config.session.subjects = vec!["Alice".to_string(), "Bob".to_string()];
    let (sink, make_sink) = memory_sink();
    let mut session = start_session(dir, config, MockFrameSource::new, |a| a, make_sink);

    session.handle.send(ControlIntent::Start).unwrap();
    let gate = next_matching(&mut session.progress, |n| {
        matches!(n, ProgressNotification::AwaitingConfirmation { .. })
    })
    .await;
    assert_eq!(
        gate,
        ProgressNotification::AwaitingConfirmation {
            next_subject: "Bob".to_string()
        }
    );
    session.handle.send(ControlIntent::ConfirmNext).unwrap();

    let summary = session.task.await.unwrap().unwrap();
    assert_eq!(summary.state, ExperimentState::Completed);
    assert_eq!(summary.completed, 4);
    assert_eq!(summary.total, 4);

    let sink = sink.lock();
    let order: Vec<(String, Shape)> = sink
        .trials
        .iter()
        .map(|t| (t.key.subject.clone(), t.key.shape))
        .collect();
    assert_eq!(
        order,
        vec![
            ("Alice".to_string(), Shape::Circle),
            ("Alice".to_string(), Shape::Square),
            ("Bob".to_string(), Shape::Circle),
            ("Bob".to_string(), Shape::Square),
        ]
    );

    let expected = Duration::from_millis(700);
    for trial in &sink.trials {
        assert_eq!(trial.cycles.len(), 2);
        for record in &trial.cycles {
            assert_eq!(record.status, CycleStatus::Completed);
            assert!(record.path.is_file(), "missing {:?}", record.path);
            let measured = record.end.unwrap() - record.start;
            let error = if measured > expected {
                measured - expected
            } else {
                expected - measured
            };
            assert!(error <= CAMERA_FRAME, "cycle window {:?}", measured);
        }
    }
    assert_eq!(avi_files(&summary.root).len(), 8);

    // Every beep starts on a refresh boundary
    let starts = session.audio.cue_onsets(Cue::StartBeep);
    assert_eq!(starts.len(), 4 * 3);
    for onset in starts.iter().chain(session.audio.cue_onsets(Cue::EndBeep).iter()) {
        assert_eq!(onset.as_nanos() % REFRESH.as_nanos(), 0, "beep at {:?}", onset);
    }

    let kinds = sink.kinds();
    assert_eq!(kinds.first(), Some(&EventKind::SessionStart));
    assert_eq!(kinds.last(), Some(&EventKind::SessionEnd));
    assert_eq!(kinds.iter().filter(|k| **k == EventKind::RecordingSaved).count(), 8);

    let checkpoint =
        lsci_session::experiment::ProgressCheckpoint::load(summary.root.join("progress.json")).unwrap();
    assert_eq!(checkpoint.queue_position, 4);
    assert_eq!(checkpoint.session_id, summary.session_id);
}

#[tokio::test]
async fn pause_discards_partial_output_and_resume_replays_the_same_trial() {
    let dir = tempfile::tempdir().unwrap();
    let config = short_config(&dir);
    let (sink, make_sink) = memory_sink();
    let mut session = start_session(dir, config, MockFrameSource::new, |a| a, make_sink);

    session.handle.send(ControlIntent::Start).unwrap();
    next_matching(&mut session.progress, |n| {
        matches!(
            n,
            ProgressNotification::PhaseChanged {
                phase: TrialPhase::CycleRecording,
                cycle: Some(2),
                ..
            }
        )
    })
    .await;
    session.handle.send(ControlIntent::Pause).unwrap();
    session
        .handle
        .wait_for(|s| s == ExperimentState::Paused)
        .await
        .unwrap();

    // Cycle 1 was complete on disk and cycle 2 was mid-recording; both are gone
    assert!(avi_files(&session.root).is_empty());
    {
        let sink = sink.lock();
        assert!(sink.trials.is_empty());
        assert_eq!(sink.cycles.len(), 2);
        assert!(sink
            .cycles
            .iter()
            .all(|(_, record)| record.status == CycleStatus::Discarded));
        assert!(sink.events.iter().all(|e| e.kind != EventKind::RecordingSaved));
        assert!(sink.cycles.iter().all(|(_, record)| !record.path.exists()));
        let end = sink
            .events
            .iter()
            .rev()
            .find(|e| e.kind == EventKind::TrialEnd)
            .unwrap();
        assert_eq!(end.status, Some(EventStatus::Interrupted));
    }

    session.handle.send(ControlIntent::Resume).unwrap();
    let replay = next_matching(&mut session.progress, |n| {
        matches!(n, ProgressNotification::TrialStarted { .. })
    })
    .await;
    match replay {
        ProgressNotification::TrialStarted {
            trial, position, ..
        } => {
            assert_eq!(trial, TrialId(0));
            assert_eq!(position, 1);
        }
        other => panic!("unexpected {:?}", other),
    }

    let summary = session.task.await.unwrap().unwrap();
    assert_eq!(summary.state, ExperimentState::Completed);
    assert_eq!(summary.completed, 2);
    assert_eq!(avi_files(&summary.root).len(), 4);

    let sink = sink.lock();
    assert_eq!(sink.trials[0].id, TrialId(0));
    assert_eq!(sink.trials[0].key.shape, Shape::Circle);
    assert!(sink.trials[0]
        .cycles
        .iter()
        .all(|r| r.status == CycleStatus::Completed && r.path.is_file()));
}

#[tokio::test]
async fn stop_during_recording_leaves_no_files_and_logs_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let config = short_config(&dir);
    let mut session = start_session(dir, config, MockFrameSource::new, |a| a, |layout| {
        Box::new(CsvEventLog::create(layout.event_log_path()).unwrap())
    });

    session.handle.send(ControlIntent::Start).unwrap();
    next_matching(&mut session.progress, |n| {
        matches!(
            n,
            ProgressNotification::PhaseChanged {
                phase: TrialPhase::CycleRecording,
                cycle: Some(1),
                ..
            }
        )
    })
    .await;
    session.handle.send(ControlIntent::Stop).unwrap();

    let summary = session.task.await.unwrap().unwrap();
    assert_eq!(summary.state, ExperimentState::Aborted);
    assert_eq!(summary.completed, 0);
    assert!(avi_files(&summary.root).is_empty());
    assert!(!summary.root.join("progress.json").exists());

    let mut reader = csv::Reader::from_path(summary.root.join("event_log.csv")).unwrap();
    let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
    let of_type = |kind: &str| -> Vec<&csv::StringRecord> {
        rows.iter().filter(|r| &r[2] == kind).collect()
    };

    let discarded = of_type("RECORDING_DISCARDED");
    assert_eq!(discarded.len(), 1);
    assert_eq!(&discarded[0][8], "Discarded");
    assert_eq!(&discarded[0][3], "Alice");
    assert!(of_type("RECORDING_SAVED").is_empty());
    assert!(rows.iter().all(|r| &r[8] != "Completed"));

    let trial_end = of_type("TRIAL_END");
    assert_eq!(trial_end.len(), 1);
    assert_eq!(&trial_end[0][8], "Interrupted");
    assert_eq!(of_type("SESSION_END").len(), 1);
}

#[tokio::test]
async fn sensor_failure_halts_the_session_until_stop() {
    let dir = tempfile::tempdir().unwrap();
    let config = short_config(&dir);
    let (sink, make_sink) = memory_sink();
    // Recording of the first cycle starts at 1.1 s, frame 110
    let mut session = start_session(
        dir,
        config,
        |clock| MockFrameSource::new(clock).failing_at(130),
        |a| a,
        make_sink,
    );

    session.handle.send(ControlIntent::Start).unwrap();
    next_matching(&mut session.progress, |n| {
        matches!(n, ProgressNotification::TrialFailed { .. })
    })
    .await;
    session
        .handle
        .wait_for(|s| s == ExperimentState::Error)
        .await
        .unwrap();
    assert!(avi_files(&session.root).is_empty());

    // Nothing advances while halted
    session.handle.send(ControlIntent::Resume).unwrap();
    session.handle.send(ControlIntent::Stop).unwrap();
    let err = session.task.await.unwrap().unwrap_err();
    assert!(matches!(err, SessionError::RecordingFailure(_)), "{}", err);

    let sink = sink.lock();
    assert!(sink.trials.is_empty());
    let end = sink
        .events
        .iter()
        .find(|e| e.kind == EventKind::TrialEnd)
        .unwrap();
    assert_eq!(end.status, Some(EventStatus::Failed));
    assert_eq!(
        sink.events
            .iter()
            .filter(|e| e.kind == EventKind::TrialStart)
            .count(),
        1
    );
}

#[tokio::test]
async fn missing_audio_device_prevents_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let config = short_config(&dir);
    let (sink, make_sink) = memory_sink();
    let session = start_session(dir, config, MockFrameSource::new, MockAudio::unavailable, make_sink);

    session.handle.send(ControlIntent::Start).unwrap();
    let err = session.task.await.unwrap().unwrap_err();
    assert!(matches!(err, SessionError::HardwareUnavailable(_)), "{}", err);
    assert_eq!(session.handle.state(), ExperimentState::Error);
    assert!(!sink.lock().kinds().contains(&EventKind::TrialStart));
}

#[test]
fn missing_camera_is_hardware_unavailable() {
    let config = SessionConfig::default();
    let clock: Arc<dyn Clock> = Arc::new(SimClock::new());
    let err = CameraCoordinator::spawn(Box::new(MockFrameSource::new(clock).unavailable()), &config.camera)
        .err()
        .unwrap();
    assert!(matches!(err, SessionError::HardwareUnavailable(_)));
}

#[test]
fn non_positive_recording_window_is_rejected_at_load() {
    let toml = r#"
        [session]
        subjects = ["Alice"]

        [timing]
        imagination_duration = 10.0
        recording_delay = 9.8

        [audio]
        start_beep_duration = 0.3
    "#;
    match SessionConfig::load_str(toml) {
        Err(SessionError::ConfigValidation(msg)) => assert!(msg.contains("Recording window"), "{}", msg),
        other => panic!("expected validation error, got {:?}", other.map(|_| ())),
    }
}
