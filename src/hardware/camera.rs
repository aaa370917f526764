//! Camera recording coordinator.
//!
//! The coordinator owns a [`FrameSource`] on a dedicated OS thread
//! (`camera-capture`) that grabs continuously from session start to
//! shutdown. Every frame is routed wholly to exactly one destination:
//!
//! ```text
//! grab ──> drain commands ──> apply start/stop due at frame.timestamp ──> route
//!                                                                        ├─ recording (AviWriter)
//!                                                                        ├─ preview (watch)
//!                                                                        └─ dropped (idle)
//! ```
//!
//! Because start/stop commands carry the session-clock time at which they
//! apply, the engine can issue them ahead of the refresh they belong to and
//! the boundary is honored to within one capture-frame period, independent
//! of channel latency. The engine interacts only through [`CameraHandle`],
//! whose methods never block.

use super::avi::AviWriter;
use super::capabilities::{CameraSettings, FrameSource};
use super::Frame;
use crate::config::CameraConfig;
use crate::error::{AppResult, SessionError};
use crate::messages::{CameraCommand, DiscardReport, RecordingStarted, RecordingStopped};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Where captured frames currently go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    Idle,
    Preview,
    Recording,
}

/// Snapshot published by the capture thread.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraStatus {
    pub mode: CaptureMode,
    pub achieved_fps: f64,
    pub frames_captured: u64,
    pub dropped_frames: u64,
    pub recording: Option<PathBuf>,
    /// Last sensor error, cleared by the next good frame
    pub fault: Option<String>,
}

impl Default for CameraStatus {
    fn default() -> Self {
        Self {
            mode: CaptureMode::Idle,
            achieved_fps: 0.0,
            frames_captured: 0,
            dropped_frames: 0,
            recording: None,
            fault: None,
        }
    }
}

/// Non-blocking interface to the capture thread.
#[derive(Clone)]
pub struct CameraHandle {
    commands: mpsc::Sender<CameraCommand>,
    preview: watch::Receiver<Option<Arc<Frame>>>,
    status: watch::Receiver<CameraStatus>,
    frame_period: Duration,
}

impl CameraHandle {
    fn send(&self, command: CameraCommand) -> AppResult<()> {
        self.commands.try_send(command).map_err(|e| match e {
            TrySendError::Full(_) => {
                SessionError::RecordingFailure("camera command queue is full".to_string())
            }
            TrySendError::Closed(_) => {
                SessionError::ChannelClosed("camera capture thread has exited".to_string())
            }
        })
    }

    /// Route frames to the preview channel whenever not recording.
    pub fn start_preview(&self) -> AppResult<()> {
        self.send(CameraCommand::StartPreview)
    }

    pub fn stop_preview(&self) -> AppResult<()> {
        self.send(CameraCommand::StopPreview)
    }

    /// Schedule a recording into `path` starting with the first frame at or after `at`.
    pub fn start_recording(
        &self,
        path: PathBuf,
        at: Duration,
        min_duration: Duration,
    ) -> AppResult<oneshot::Receiver<AppResult<RecordingStarted>>> {
        let (cmd, rx) = CameraCommand::start_recording(path, at, min_duration);
        self.send(cmd)?;
        Ok(rx)
    }

    /// Schedule the active recording to close at the first frame at or after `at`.
    pub fn stop_recording(
        &self,
        at: Duration,
    ) -> AppResult<oneshot::Receiver<AppResult<RecordingStopped>>> {
        let (cmd, rx) = CameraCommand::stop_recording(at);
        self.send(cmd)?;
        Ok(rx)
    }

    /// Abandon any recording now and delete `paths`.
    pub fn discard(&self, paths: Vec<PathBuf>) -> AppResult<oneshot::Receiver<DiscardReport>> {
        let (cmd, rx) = CameraCommand::discard(paths);
        self.send(cmd)?;
        Ok(rx)
    }

    /// Latest preview frame.
    pub fn preview(&self) -> watch::Receiver<Option<Arc<Frame>>> {
        self.preview.clone()
    }

    /// Current capture status.
    pub fn status(&self) -> CameraStatus {
        self.status.borrow().clone()
    }

    /// Status updates as they are published.
    pub fn subscribe_status(&self) -> watch::Receiver<CameraStatus> {
        self.status.clone()
    }

    /// Nominal time between frames.
    pub fn frame_period(&self) -> Duration {
        self.frame_period
    }
}

/// Owner of the capture thread.
pub struct CameraCoordinator {
    handle: CameraHandle,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CameraCoordinator {
    /// Open the camera and start the capture thread.
    ///
    /// # Errors
    /// `HardwareUnavailable` if no camera is found or it cannot be opened.
    pub fn spawn(mut source: Box<dyn FrameSource>, config: &CameraConfig) -> AppResult<Self> {
        let cameras = source
            .enumerate()
            .map_err(|e| SessionError::HardwareUnavailable(format!("camera enumeration failed: {e:#}")))?;
        let camera = cameras
            .iter()
            .find(|c| c.index == config.device_index)
            .ok_or_else(|| {
                SessionError::HardwareUnavailable(format!(
                    "camera {} not found ({} available)",
                    config.device_index,
                    cameras.len()
                ))
            })?;
        info!(camera = %camera.name, index = camera.index, "Opening camera");

        let settings = CameraSettings::from(config);
        source
            .open(&settings)
            .map_err(|e| SessionError::HardwareUnavailable(format!("camera open failed: {e:#}")))?;

        let (command_tx, command_rx) = mpsc::channel(config.command_capacity);
        let (preview_tx, preview_rx) = watch::channel(None);
        let (status_tx, status_rx) = watch::channel(CameraStatus::default());
        let frame_period = settings.frame_period();
        let stop = Arc::new(AtomicBool::new(false));

        let capture = CaptureLoop {
            source,
            stop: Arc::clone(&stop),
            commands: command_rx,
            scheduled: VecDeque::new(),
            preview_enabled: false,
            recording: None,
            preview_tx,
            status_tx,
            status: CameraStatus::default(),
            last_index: None,
            last_published: None,
            grab_timeout: Duration::from_millis(config.grab_timeout_ms.max(1)),
            frame_period,
            min_fraction: config.min_recorded_fraction,
        };
        let thread = std::thread::Builder::new()
            .name("camera-capture".to_string())
            .spawn(move || capture.run())?;

        Ok(Self {
            handle: CameraHandle {
                commands: command_tx,
                preview: preview_rx,
                status: status_rx,
                frame_period,
            },
            stop,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> CameraHandle {
        self.handle.clone()
    }

    /// Stop the capture thread and wait for it to release the camera.
    pub fn shutdown(mut self) {
        self.stop_thread();
    }

    fn stop_thread(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.stop.store(true, Ordering::SeqCst);
            if thread.join().is_err() {
                error!("Camera capture thread panicked");
            }
        }
    }
}

impl Drop for CameraCoordinator {
    fn drop(&mut self) {
        self.stop_thread();
    }
}

// =============================================================================
// Capture thread
// =============================================================================

enum Scheduled {
    Start {
        path: PathBuf,
        at: Duration,
        min_duration: Duration,
        response: oneshot::Sender<AppResult<RecordingStarted>>,
    },
    Stop {
        at: Duration,
        response: oneshot::Sender<AppResult<RecordingStopped>>,
    },
}

impl Scheduled {
    fn at(&self) -> Duration {
        match self {
            Scheduled::Start { at, .. } | Scheduled::Stop { at, .. } => *at,
        }
    }

    fn fail(self, reason: &str) {
        let err = || SessionError::RecordingFailure(reason.to_string());
        match self {
            Scheduled::Start { response, .. } => {
                let _ = response.send(Err(err()));
            }
            Scheduled::Stop { response, .. } => {
                let _ = response.send(Err(err()));
            }
        }
    }
}

struct ActiveRecording {
    writer: Option<AviWriter>,
    path: PathBuf,
    started_at: Duration,
    min_duration: Duration,
    dropped: u64,
    failure: Option<String>,
}

struct CaptureLoop {
    source: Box<dyn FrameSource>,
    stop: Arc<AtomicBool>,
    commands: mpsc::Receiver<CameraCommand>,
    scheduled: VecDeque<Scheduled>,
    preview_enabled: bool,
    recording: Option<ActiveRecording>,
    preview_tx: watch::Sender<Option<Arc<Frame>>>,
    status_tx: watch::Sender<CameraStatus>,
    status: CameraStatus,
    last_index: Option<u64>,
    last_published: Option<Duration>,
    grab_timeout: Duration,
    frame_period: Duration,
    min_fraction: f64,
}

impl CaptureLoop {
    fn run(mut self) {
        info!("Camera capture loop started");
        while !self.stop.load(Ordering::SeqCst) {
            let frame = match self.source.grab(self.grab_timeout) {
                Ok(frame) => frame,
                Err(e) => {
                    self.on_sensor_error(&format!("{e:#}"));
                    std::thread::sleep(self.grab_timeout);
                    None
                }
            };

            // Commands are drained after the grab so anything sent before this
            // frame's exposure is applied to it.
            loop {
                match self.commands.try_recv() {
                    Err(TryRecvError::Disconnected) => {
                        self.shutdown();
                        return;
                    }
                    Ok(command) => self.handle(command),
                    Err(TryRecvError::Empty) => break,
                }
            }

            if let Some(frame) = frame {
                self.apply_due(&frame);
                self.route(frame);
            }
        }
        self.shutdown();
    }

    fn handle(&mut self, command: CameraCommand) {
        match command {
            CameraCommand::StartPreview => {
                self.preview_enabled = true;
                self.publish_mode();
            }
            CameraCommand::StopPreview => {
                self.preview_enabled = false;
                self.publish_mode();
            }
            CameraCommand::StartRecording {
                path,
                at,
                min_duration,
                response,
            } => {
                debug!(path = ?path, at_ms = at.as_millis() as u64, "Recording scheduled");
                self.scheduled.push_back(Scheduled::Start {
                    path,
                    at,
                    min_duration,
                    response,
                });
            }
            CameraCommand::StopRecording { at, response } => {
                self.scheduled.push_back(Scheduled::Stop { at, response });
            }
            CameraCommand::Discard { paths, response } => {
                let report = self.discard(paths);
                let _ = response.send(report);
            }
        }
    }

    fn apply_due(&mut self, frame: &Frame) {
        let timestamp = frame.timestamp;
        while self
            .scheduled
            .front()
            .is_some_and(|s| s.at() <= timestamp)
        {
            let Some(next) = self.scheduled.pop_front() else {
                break;
            };
            match next {
                Scheduled::Start {
                    path,
                    min_duration,
                    response,
                    ..
                } => {
                    let result =
                        self.begin_recording(path, frame, min_duration);
                    let _ = response.send(result);
                }
                Scheduled::Stop { response, .. } => {
                    let result = self.end_recording(timestamp);
                    let _ = response.send(result);
                }
            }
        }
    }

    fn begin_recording(
        &mut self,
        path: PathBuf,
        frame: &Frame,
        min_duration: Duration,
    ) -> AppResult<RecordingStarted> {
        let timestamp = frame.timestamp;
        if let Some(active) = &self.recording {
            return Err(SessionError::RecordingFailure(format!(
                "recording {:?} is still open",
                active.path
            )));
        }
        let fps = 1.0 / self.frame_period.as_secs_f64();
        let writer = AviWriter::create(&path, frame.width, frame.height, fps)
            .map_err(|e| SessionError::RecordingFailure(format!("{e:#}")))?;
        info!(path = ?path, first_frame_ms = timestamp.as_millis() as u64, "Recording started");
        self.recording = Some(ActiveRecording {
            writer: Some(writer),
            path: path.clone(),
            started_at: timestamp,
            min_duration,
            dropped: 0,
            failure: None,
        });
        self.publish_mode();
        Ok(RecordingStarted {
            path,
            first_frame_at: timestamp,
        })
    }

    fn end_recording(&mut self, timestamp: Duration) -> AppResult<RecordingStopped> {
        let Some(mut active) = self.recording.take() else {
            return Err(SessionError::RecordingFailure(
                "stop requested with no recording open".to_string(),
            ));
        };
        self.publish_mode();

        if let Some(reason) = active.failure.take() {
            return Err(SessionError::RecordingFailure(reason));
        }
        let writer = active.writer.take().ok_or_else(|| {
            SessionError::RecordingFailure(format!("recording {:?} lost its writer", active.path))
        })?;
        let frames = writer
            .finish()
            .map_err(|e| SessionError::RecordingFailure(format!("{e:#}")))?;

        let recorded = self.frame_period.as_secs_f64() * f64::from(frames);
        let required = active.min_duration.as_secs_f64() * self.min_fraction;
        if active.dropped > 0 {
            warn!(
                path = ?active.path,
                dropped = active.dropped,
                frames,
                "Frames dropped during recording"
            );
        }
        if recorded < required {
            return Err(SessionError::RecordingFailure(format!(
                "{:?} holds {:.3}s of frames, below the {:.3}s minimum ({} dropped)",
                active.path, recorded, required, active.dropped
            )));
        }

        info!(path = ?active.path, frames, "Recording saved");
        Ok(RecordingStopped {
            path: active.path,
            frames,
            started_at: active.started_at,
            stopped_at: timestamp,
            dropped_frames: active.dropped,
        })
    }

    fn discard(&mut self, paths: Vec<PathBuf>) -> DiscardReport {
        // Scheduled commands are dropped; their receivers observe a closed channel
        self.scheduled.clear();

        let mut report = DiscardReport::default();
        let mut targets = paths;
        if let Some(mut active) = self.recording.take() {
            // Dropping the writer closes the file
            active.writer.take();
            if !targets.contains(&active.path) {
                targets.push(active.path);
            }
            self.publish_mode();
        }
        for path in targets {
            remove_file(&path, &mut report);
        }
        info!(deleted = report.deleted.len(), "Recordings discarded");
        report
    }

    fn route(&mut self, frame: Frame) {
        let gap = match self.last_index {
            Some(last) if frame.index > last + 1 => frame.index - last - 1,
            _ => 0,
        };
        if gap > 0 {
            warn!(after = self.last_index, gap, "Camera dropped frames");
            self.status.dropped_frames += gap;
        }
        self.last_index = Some(frame.index);
        self.status.frames_captured += 1;
        self.status.fault = None;
        let timestamp = frame.timestamp;

        if let Some(active) = self.recording.as_mut() {
            active.dropped += gap;
            if let Some(writer) = active.writer.as_mut() {
                if let Err(e) = writer.write_frame(&frame) {
                    error!(path = ?active.path, "Recording write failed: {e:#}");
                    active.failure = Some(format!("{e:#}"));
                    active.writer = None;
                }
            }
        } else if self.preview_enabled {
            self.preview_tx.send_replace(Some(Arc::new(frame)));
        }

        let due = self
            .last_published
            .map_or(true, |t| timestamp.saturating_sub(t) >= Duration::from_millis(250));
        if due {
            self.last_published = Some(timestamp);
            self.status.achieved_fps = self.source.achieved_fps();
            self.status_tx.send_replace(self.status.clone());
        }
    }

    fn on_sensor_error(&mut self, reason: &str) {
        error!("Camera grab failed: {}", reason);
        if let Some(active) = self.recording.as_mut() {
            active.writer = None;
            active.failure.get_or_insert_with(|| format!("camera failure: {reason}"));
        }
        // Nothing scheduled can happen without frames
        let pending: Vec<Scheduled> = self.scheduled.drain(..).collect();
        for scheduled in pending {
            if let Scheduled::Stop { response, .. } = scheduled {
                let result = match self.recording.take() {
                    Some(active) => Err(SessionError::RecordingFailure(
                        active
                            .failure
                            .unwrap_or_else(|| format!("camera failure: {reason}")),
                    )),
                    None => Err(SessionError::RecordingFailure(format!(
                        "camera failure: {reason}"
                    ))),
                };
                let _ = response.send(result);
            } else {
                scheduled.fail(&format!("camera failure: {reason}"));
            }
        }
        self.status.fault = Some(reason.to_string());
        self.publish_mode();
    }

    fn publish_mode(&mut self) {
        self.status.mode = if self.recording.is_some() {
            CaptureMode::Recording
        } else if self.preview_enabled {
            CaptureMode::Preview
        } else {
            CaptureMode::Idle
        };
        self.status.recording = self.recording.as_ref().map(|r| r.path.clone());
        self.status_tx.send_replace(self.status.clone());
    }

    fn shutdown(&mut self) {
        for scheduled in self.scheduled.drain(..) {
            scheduled.fail("camera shut down");
        }
        if let Some(mut active) = self.recording.take() {
            if let Some(writer) = active.writer.take() {
                match writer.finish() {
                    Ok(frames) => warn!(path = ?active.path, frames, "Recording closed at shutdown"),
                    Err(e) => error!(path = ?active.path, "Failed to close recording: {e:#}"),
                }
            }
        }
        self.source.close();
        info!(frames = self.status.frames_captured, "Camera capture loop stopped");
    }
}

fn remove_file(path: &Path, report: &mut DiscardReport) {
    match std::fs::remove_file(path) {
        Ok(()) => report.deleted.push(path.to_path_buf()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            warn!(path = ?path, "Failed to delete recording: {}", e);
            report.failed.push((path.to_path_buf(), e.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockFrameSource;
    use crate::hardware::SimClock;
    use tempfile::tempdir;
    use tokio::time::timeout;

    fn config() -> CameraConfig {
        CameraConfig {
            width: 8,
            height: 4,
            target_fps: 100.0,
            grab_timeout_ms: 2,
            ..CameraConfig::default()
        }
    }

    fn spawn(source: MockFrameSource) -> CameraCoordinator {
        CameraCoordinator::spawn(Box::new(source), &config()).unwrap()
    }

    async fn ack<T>(rx: oneshot::Receiver<T>) -> T {
        timeout(Duration::from_secs(5), rx)
            .await
            .expect("acknowledgment timed out")
            .expect("acknowledgment dropped")
    }

    #[tokio::test]
    async fn records_between_commanded_timestamps() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cycle1.avi");
        let clock = SimClock::new();
        let camera = spawn(MockFrameSource::new(Arc::new(clock.clone())));
        let handle = camera.handle();

        let start = handle
            .start_recording(path.clone(), Duration::from_millis(100), Duration::from_millis(200))
            .unwrap();
        let stop = handle.stop_recording(Duration::from_millis(300)).unwrap();
        clock.set(Duration::from_millis(500));

        let started = ack(start).await.unwrap();
        assert_eq!(started.first_frame_at, Duration::from_millis(100));
        let stopped = ack(stop).await.unwrap();
        assert_eq!(stopped.frames, 20);
        assert_eq!(stopped.stopped_at - stopped.started_at, Duration::from_millis(200));
        assert_eq!(stopped.dropped_frames, 0);
        assert!(path.exists());
        camera.shutdown();
    }

    #[tokio::test]
    async fn discard_deletes_active_and_listed_files() {
        let dir = tempdir().unwrap();
        let done = dir.path().join("cycle1.avi");
        std::fs::write(&done, b"finished").unwrap();
        let active = dir.path().join("cycle2.avi");

        let clock = SimClock::new();
        let camera = spawn(MockFrameSource::new(Arc::new(clock.clone())));
        let handle = camera.handle();

        let start = handle
            .start_recording(active.clone(), Duration::from_millis(50), Duration::from_secs(1))
            .unwrap();
        let stop = handle.stop_recording(Duration::from_secs(2)).unwrap();
        clock.set(Duration::from_millis(150));
        ack(start).await.unwrap();
        assert!(active.exists());

        let report = ack(handle.discard(vec![done.clone()]).unwrap()).await;
        assert!(report.deleted.contains(&done));
        assert!(report.deleted.contains(&active));
        assert!(!done.exists());
        assert!(!active.exists());
        // The scheduled stop was abandoned with the recording
        assert!(stop.await.is_err());
        camera.shutdown();
    }

    #[tokio::test]
    async fn too_many_dropped_frames_fail_the_recording() {
        let dir = tempdir().unwrap();
        let clock = SimClock::new();
        let camera = spawn(MockFrameSource::new(Arc::new(clock.clone())).with_dropped_frames(12..26));
        let handle = camera.handle();

        let start = handle
            .start_recording(
                dir.path().join("short.avi"),
                Duration::from_millis(100),
                Duration::from_millis(200),
            )
            .unwrap();
        let stop = handle.stop_recording(Duration::from_millis(300)).unwrap();
        clock.set(Duration::from_millis(500));

        ack(start).await.unwrap();
        match ack(stop).await {
            Err(SessionError::RecordingFailure(msg)) => assert!(msg.contains("minimum")),
            other => panic!("expected recording failure, got {:?}", other),
        }
        camera.shutdown();
    }

    #[tokio::test]
    async fn sensor_failure_is_reported_on_stop() {
        let dir = tempdir().unwrap();
        let clock = SimClock::new();
        let camera = spawn(MockFrameSource::new(Arc::new(clock.clone())).failing_at(15));
        let handle = camera.handle();

        let start = handle
            .start_recording(
                dir.path().join("broken.avi"),
                Duration::from_millis(100),
                Duration::from_millis(200),
            )
            .unwrap();
        let stop = handle.stop_recording(Duration::from_millis(300)).unwrap();
        clock.set(Duration::from_millis(500));

        ack(start).await.unwrap();
        assert!(matches!(ack(stop).await, Err(SessionError::RecordingFailure(_))));
        camera.shutdown();
    }

    #[tokio::test]
    async fn preview_receives_frames_outside_recordings() {
        let clock = SimClock::new();
        let camera = spawn(MockFrameSource::new(Arc::new(clock.clone())));
        let handle = camera.handle();
        let mut preview = handle.preview();

        handle.start_preview().unwrap();
        clock.set(Duration::from_millis(100));
        timeout(Duration::from_secs(5), preview.changed())
            .await
            .unwrap()
            .unwrap();
        let frame = preview.borrow().clone().unwrap();
        assert_eq!((frame.width, frame.height), (8, 4));
        camera.shutdown();
    }

    #[test]
    fn missing_camera_is_unavailable() {
        let clock = SimClock::new();
        let result =
            CameraCoordinator::spawn(Box::new(MockFrameSource::new(Arc::new(clock)).unavailable()), &config());
        assert!(matches!(result, Err(SessionError::HardwareUnavailable(_))));
    }
}
