//! Mock Hardware Implementations
//!
//! Simulated devices for tests and dry runs without a stimulus monitor,
//! sound card or high-speed camera.
//!
//! # Available Mocks
//!
//! - `MockDisplay` - refresh-locked display in virtual or real time
//! - `MockAudio` - records every cue with its session-clock time
//! - `MockFrameSource` - camera producing frame `k` at `k / fps`, with optional
//!   dropped frames and an injectable sensor failure
//!
//! In virtual time the display drives a shared [`SimClock`]: every
//! `wait_refresh` jumps the clock to the next refresh, and the mock camera
//! delivers frames as the clock passes their timestamps. A whole session then
//! runs in milliseconds while keeping the exact timing relationships.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::hardware::capabilities::{
    AudioOutput, CameraInfo, CameraSettings, FrameSource, RefreshCallback, StimulusDisplay,
};
use crate::hardware::{
    Clock, Cue, Frame, Instruction, RefreshTick, SimClock, StimulusView, ToneBuffer,
};
use crate::config::PixelFormat;

// =============================================================================
// MockDisplay - Simulated Stimulus Window
// =============================================================================

enum Pacing {
    /// Jump a virtual clock to each refresh
    Virtual(SimClock),
    /// Sleep until each refresh on the wall clock
    RealTime(Arc<dyn Clock>),
}

/// A visible change recorded by [`MockDisplay`].
#[derive(Debug, Clone, PartialEq)]
pub struct FlipRecord {
    pub tick: RefreshTick,
    pub view: StimulusView,
}

/// Shared view of what a [`MockDisplay`] has shown.
#[derive(Debug, Clone, Default)]
pub struct DisplayLog {
    changes: Arc<Mutex<Vec<FlipRecord>>>,
    refreshes: Arc<Mutex<u64>>,
}

impl DisplayLog {
    /// Every refresh at which the visible content changed.
    pub fn changes(&self) -> Vec<FlipRecord> {
        self.changes.lock().clone()
    }

    /// Total refreshes so far.
    pub fn refreshes(&self) -> u64 {
        *self.refreshes.lock()
    }
}

/// Mock display with a fixed refresh rate.
///
/// # Example
///
/// ```rust,ignore
/// let clock = SimClock::new();
/// let mut display = MockDisplay::virtual_time(60.0, clock.clone());
/// display.draw(StimulusView::Blank);
/// let tick = display.wait_refresh().await?;
/// assert_eq!(clock.now(), tick.timestamp);
/// ```
pub struct MockDisplay {
    refresh_hz: f64,
    pacing: Pacing,
    started: Option<Instant>,
    index: u64,
    pending: Option<StimulusView>,
    visible: StimulusView,
    callbacks: Vec<RefreshCallback>,
    available: bool,
    log: DisplayLog,
}

impl MockDisplay {
    /// Display that advances `clock` by one refresh period per `wait_refresh`.
    pub fn virtual_time(refresh_hz: f64, clock: SimClock) -> Self {
        Self::with_pacing(refresh_hz, Pacing::Virtual(clock))
    }

    /// Display that sleeps for one refresh period per `wait_refresh`.
    pub fn real_time(refresh_hz: f64, clock: Arc<dyn Clock>) -> Self {
        Self::with_pacing(refresh_hz, Pacing::RealTime(clock))
    }

    fn with_pacing(refresh_hz: f64, pacing: Pacing) -> Self {
        Self {
            refresh_hz,
            pacing,
            started: None,
            index: 0,
            pending: None,
            visible: StimulusView::Idle,
            callbacks: Vec::new(),
            available: true,
            log: DisplayLog::default(),
        }
    }

    /// Simulate a missing monitor.
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    /// Handle for inspecting the display after it moved into the engine.
    pub fn log(&self) -> DisplayLog {
        self.log.clone()
    }

    fn refresh_time(&self, index: u64) -> Duration {
        Duration::from_nanos((index as f64 * 1e9 / self.refresh_hz).round() as u64)
    }
}

#[async_trait]
impl StimulusDisplay for MockDisplay {
    fn refresh_rate_hz(&self) -> f64 {
        self.refresh_hz
    }

    fn check(&self) -> Result<()> {
        if self.available {
            Ok(())
        } else {
            Err(anyhow!("MockDisplay: no stimulus monitor attached"))
        }
    }

    fn draw(&mut self, view: StimulusView) {
        self.pending = Some(view);
    }

    fn schedule_on_refresh(&mut self, callback: RefreshCallback) {
        self.callbacks.push(callback);
    }

    async fn wait_refresh(&mut self) -> Result<RefreshTick> {
        if !self.available {
            bail!("MockDisplay: display lost");
        }
        self.index += 1;
        let timestamp = match &self.pacing {
            Pacing::Virtual(clock) => {
                let t = self.refresh_time(self.index);
                clock.set(t);
                // Let other tasks on the runtime observe the new time
                tokio::task::yield_now().await;
                t
            }
            Pacing::RealTime(clock) => {
                let started = *self.started.get_or_insert_with(Instant::now);
                let deadline = started + self.refresh_time(self.index);
                tokio::time::sleep_until(deadline.into()).await;
                clock.now()
            }
        };

        let tick = RefreshTick {
            index: self.index,
            timestamp,
        };
        if let Some(view) = self.pending.take() {
            if view != self.visible {
                self.visible = view;
                self.log.changes.lock().push(FlipRecord { tick, view });
            }
        }
        for callback in self.callbacks.drain(..) {
            callback(&tick);
        }
        *self.log.refreshes.lock() = self.index;
        Ok(tick)
    }
}

// =============================================================================
// MockAudio - Simulated Sound Output
// =============================================================================

/// What [`MockAudio`] was asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioAction {
    Cue(Cue),
    Instruction(Instruction),
    StopAll,
}

/// A recorded audio action with its session-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioEvent {
    pub at: Duration,
    pub action: AudioAction,
}

/// Mock audio output that records every call.
pub struct MockAudio {
    clock: Arc<dyn Clock>,
    prepared: Mutex<HashMap<Cue, ToneBuffer>>,
    events: Mutex<Vec<AudioEvent>>,
    available: AtomicBool,
}

impl MockAudio {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            prepared: Mutex::new(HashMap::new()),
            events: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate a missing sound card.
    pub fn unavailable(self) -> Self {
        self.available.store(false, Ordering::SeqCst);
        self
    }

    /// Everything played so far.
    pub fn events(&self) -> Vec<AudioEvent> {
        self.events.lock().clone()
    }

    /// Times at which `cue` started.
    pub fn cue_onsets(&self, cue: Cue) -> Vec<Duration> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.action == AudioAction::Cue(cue))
            .map(|e| e.at)
            .collect()
    }

    /// Sample count of a prepared cue.
    pub fn prepared_len(&self, cue: Cue) -> Option<usize> {
        self.prepared.lock().get(&cue).map(ToneBuffer::len)
    }

    fn record(&self, action: AudioAction) {
        let at = self.clock.now();
        self.events.lock().push(AudioEvent { at, action });
    }
}

impl AudioOutput for MockAudio {
    fn check(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(anyhow!("MockAudio: no output device"))
        }
    }

    fn prepare(&self, cue: Cue, tone: ToneBuffer) -> Result<()> {
        if tone.is_empty() {
            bail!("MockAudio: empty buffer for {:?}", cue);
        }
        self.prepared.lock().insert(cue, tone);
        Ok(())
    }

    fn play(&self, cue: Cue) -> Result<()> {
        if !self.prepared.lock().contains_key(&cue) {
            bail!("MockAudio: cue {:?} was never prepared", cue);
        }
        self.record(AudioAction::Cue(cue));
        Ok(())
    }

    fn play_instruction(&self, instruction: Instruction) -> Result<()> {
        self.record(AudioAction::Instruction(instruction));
        Ok(())
    }

    fn stop_all(&self) {
        self.record(AudioAction::StopAll);
    }
}

// =============================================================================
// MockFrameSource - Simulated High-Speed Camera
// =============================================================================

/// Mock camera delivering frame `k` once the clock passes `k / fps`.
///
/// Pixels form a moving gradient so consecutive frames differ.
pub struct MockFrameSource {
    clock: Arc<dyn Clock>,
    settings: Option<CameraSettings>,
    opened_at: Duration,
    next_index: u64,
    dropped: HashSet<u64>,
    fail_at: Option<u64>,
    poll: Duration,
    available: bool,
    delivered: u64,
    first_ts: Option<Duration>,
    last_ts: Duration,
}

impl MockFrameSource {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            settings: None,
            opened_at: Duration::ZERO,
            next_index: 0,
            dropped: HashSet::new(),
            fail_at: None,
            poll: Duration::from_micros(200),
            available: true,
            delivered: 0,
            first_ts: None,
            last_ts: Duration::ZERO,
        }
    }

    /// Frames with these indices are lost by the sensor.
    pub fn with_dropped_frames<I: IntoIterator<Item = u64>>(mut self, indices: I) -> Self {
        self.dropped.extend(indices);
        self
    }

    /// Fail every grab from frame `index` on.
    pub fn failing_at(mut self, index: u64) -> Self {
        self.fail_at = Some(index);
        self
    }

    /// Simulate an empty camera bus.
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    fn frame_time(&self, settings: &CameraSettings, index: u64) -> Duration {
        self.opened_at + Duration::from_nanos((index as f64 * 1e9 / settings.target_fps).round() as u64)
    }

    fn render(settings: &CameraSettings, index: u64, timestamp: Duration) -> Frame {
        let (width, height) = settings.resolution;
        match settings.pixel_format {
            PixelFormat::Mono8 => {
                let data = (0..height)
                    .flat_map(|y| (0..width).map(move |x| (x + y) as u64))
                    .map(|v| (v + index) as u8)
                    .collect();
                Frame::from_u8(index, timestamp, width, height, data)
            }
            PixelFormat::Mono16 => {
                let pixels: Vec<u16> = (0..height)
                    .flat_map(|y| (0..width).map(move |x| (x + y) as u64))
                    .map(|v| ((v + index) * 64) as u16)
                    .collect();
                Frame::from_u16(index, timestamp, width, height, &pixels)
            }
        }
    }
}

impl FrameSource for MockFrameSource {
    fn enumerate(&self) -> Result<Vec<CameraInfo>> {
        if !self.available {
            return Ok(Vec::new());
        }
        Ok(vec![CameraInfo {
            index: 0,
            name: "Mock high-speed camera".to_string(),
        }])
    }

    fn open(&mut self, settings: &CameraSettings) -> Result<()> {
        if !self.available {
            bail!("MockFrameSource: no camera found");
        }
        if settings.target_fps <= 0.0 {
            bail!("MockFrameSource: invalid frame rate {}", settings.target_fps);
        }
        self.settings = Some(settings.clone());
        self.opened_at = self.clock.now();
        self.next_index = 0;
        Ok(())
    }

    fn grab(&mut self, timeout: Duration) -> Result<Option<Frame>> {
        let settings = self
            .settings
            .clone()
            .ok_or_else(|| anyhow!("MockFrameSource: grab before open"))?;
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(fail_at) = self.fail_at {
                if self.next_index >= fail_at {
                    bail!("MockFrameSource: sensor stopped responding at frame {}", fail_at);
                }
            }
            let timestamp = self.frame_time(&settings, self.next_index);
            if self.clock.now() >= timestamp {
                let index = self.next_index;
                self.next_index += 1;
                if self.dropped.contains(&index) {
                    continue;
                }
                self.delivered += 1;
                self.first_ts.get_or_insert(timestamp);
                self.last_ts = timestamp;
                return Ok(Some(Self::render(&settings, index, timestamp)));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            std::thread::sleep(self.poll.min(deadline - now));
        }
    }

    fn achieved_fps(&self) -> f64 {
        match self.first_ts {
            Some(first) if self.delivered > 1 && self.last_ts > first => {
                (self.delivered - 1) as f64 / (self.last_ts - first).as_secs_f64()
            }
            _ => 0.0,
        }
    }

    fn close(&mut self) {
        self.settings = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(fps: f64) -> CameraSettings {
        CameraSettings {
            resolution: (4, 2),
            pixel_format: PixelFormat::Mono8,
            exposure_us: 1000.0,
            gain_db: 0.0,
            target_fps: fps,
        }
    }

    #[tokio::test]
    async fn virtual_display_fires_callbacks_on_the_refresh() {
        let clock = SimClock::new();
        let mut display = MockDisplay::virtual_time(50.0, clock.clone());
        let fired = Arc::new(Mutex::new(Vec::new()));

        display.draw(StimulusView::Blank);
        let sink = Arc::clone(&fired);
        display.schedule_on_refresh(Box::new(move |tick| sink.lock().push(tick.index)));

        let tick = display.wait_refresh().await.unwrap();
        assert_eq!(tick.index, 1);
        assert_eq!(tick.timestamp, Duration::from_millis(20));
        assert_eq!(clock.now(), Duration::from_millis(20));
        assert_eq!(*fired.lock(), vec![1]);

        // Callbacks fire once only
        display.wait_refresh().await.unwrap();
        assert_eq!(*fired.lock(), vec![1]);
        assert_eq!(display.log().changes().len(), 1);
        assert_eq!(display.log().refreshes(), 2);
    }

    #[test]
    fn audio_requires_prepared_cues() {
        let clock = SimClock::new();
        let audio = MockAudio::new(Arc::new(clock.clone()));
        assert!(audio.play(Cue::StartBeep).is_err());

        audio
            .prepare(Cue::StartBeep, ToneBuffer::sine(1000.0, 0.1, 8000, 0.5, 0.0))
            .unwrap();
        clock.advance(Duration::from_millis(5));
        audio.play(Cue::StartBeep).unwrap();
        assert_eq!(audio.cue_onsets(Cue::StartBeep), vec![Duration::from_millis(5)]);
        assert_eq!(audio.prepared_len(Cue::StartBeep), Some(800));
    }

    #[test]
    fn frame_source_follows_the_clock() {
        let clock = SimClock::new();
        let mut source = MockFrameSource::new(Arc::new(clock.clone())).with_dropped_frames([1]);
        source.open(&settings(100.0)).unwrap();

        let first = source.grab(Duration::from_millis(1)).unwrap().unwrap();
        assert_eq!(first.index, 0);
        assert!(source.grab(Duration::from_millis(1)).unwrap().is_none());

        clock.set(Duration::from_millis(25));
        let next = source.grab(Duration::from_millis(1)).unwrap().unwrap();
        assert_eq!(next.index, 2);
        assert_eq!(next.timestamp, Duration::from_millis(20));
        assert_eq!(next.data.len(), 8);
    }

    #[test]
    fn frame_source_failure_and_availability() {
        let clock = SimClock::new();
        let mut source = MockFrameSource::new(Arc::new(clock.clone())).failing_at(1);
        source.open(&settings(100.0)).unwrap();
        assert!(source.grab(Duration::ZERO).unwrap().is_some());
        clock.set(Duration::from_secs(1));
        assert!(source.grab(Duration::ZERO).is_err());

        let mut missing = MockFrameSource::new(Arc::new(clock)).unavailable();
        assert!(missing.enumerate().unwrap().is_empty());
        assert!(missing.open(&settings(100.0)).is_err());
    }
}
