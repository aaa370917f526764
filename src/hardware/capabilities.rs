//! Hardware Capabilities
//!
//! Narrow traits for the three devices a session drives. The engine never
//! talks to a vendor SDK directly; it holds trait objects and the concrete
//! device (real or [`mock`](crate::hardware::mock)) is chosen at startup.
//!
//! - [`StimulusDisplay`]: refresh-locked stimulus window (owned by the engine context)
//! - [`AudioOutput`]: preloaded beep and instruction playback
//! - [`FrameSource`]: blocking camera grab interface (owned by the capture thread)
//!
//! # Design Philosophy
//!
//! - Errors are `anyhow::Result`; the engine maps them into
//!   [`SessionError`](crate::error::SessionError) at the boundary
//! - Display and audio are checked once before the first trial
//! - Anything that must coincide with a visible change is registered with
//!   [`StimulusDisplay::schedule_on_refresh`], never fired from a timer
//!
//! # Example
//!
//! ```rust,ignore
//! // Make a shape and its start beep appear on the same refresh
//! display.draw(StimulusView::Shape(Shape::Circle));
//! let audio = Arc::clone(&audio);
//! display.schedule_on_refresh(Box::new(move |_tick| {
//!     let _ = audio.play(Cue::StartBeep);
//! }));
//! let tick = display.wait_refresh().await?;
//! ```

use super::{Cue, Frame, Instruction, RefreshTick, StimulusView, ToneBuffer};
use crate::config::{CameraConfig, PixelFormat};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Work to run exactly once when the next refresh makes the back buffer visible.
pub type RefreshCallback = Box<dyn FnOnce(&RefreshTick) + Send>;

/// Capability: Refresh-Locked Stimulus Display
///
/// # Contract
/// - `draw` sets the content of the *next* frame (back buffer); it is not
///   visible until the following `wait_refresh` completes
/// - Content persists across refreshes until drawn again
/// - Callbacks registered with `schedule_on_refresh` fire exactly once, in
///   registration order, at the refresh that makes the pending frame visible
/// - `wait_refresh` returns the tick of that refresh
///
/// # Thread Safety
/// The display is exclusively owned by the engine context, so mutation takes
/// `&mut self`. Implementations only need to be `Send` to move onto the engine
/// thread.
#[async_trait]
pub trait StimulusDisplay: Send {
    /// Nominal refresh rate used for duration to frame-count conversion.
    fn refresh_rate_hz(&self) -> f64;

    /// Verify the display is present and can flip.
    ///
    /// Called once before any trial; an error here aborts the session.
    fn check(&self) -> Result<()>;

    /// Set the content of the next frame.
    fn draw(&mut self, view: StimulusView);

    /// Register `callback` to fire when the next refresh occurs.
    fn schedule_on_refresh(&mut self, callback: RefreshCallback);

    /// Block until the next refresh, fire pending callbacks, and return its tick.
    ///
    /// # Returns
    /// - Ok(tick) once the pending frame is visible
    /// - Err if the display was lost
    async fn wait_refresh(&mut self) -> Result<RefreshTick>;
}

/// Capability: Audio Cue Playback
///
/// # Contract
/// - Beep buffers are prepared before the session and never resynthesized
/// - `play` must return quickly; it runs inside refresh callbacks
/// - A playing beep ends by itself when its buffer is exhausted
/// - `stop_all` silences every voice immediately (used on interrupt)
///
/// # Thread Safety
/// Shared as `Arc<dyn AudioOutput>` so refresh callbacks can capture it.
pub trait AudioOutput: Send + Sync {
    /// Verify an output device is open.
    fn check(&self) -> Result<()>;

    /// Load the buffer for a cue.
    fn prepare(&self, cue: Cue, tone: ToneBuffer) -> Result<()>;

    /// Start a prepared cue.
    ///
    /// # Returns
    /// - Err if the cue was never prepared or the device failed
    fn play(&self, cue: Cue) -> Result<()>;

    /// Start a spoken instruction clip.
    fn play_instruction(&self, instruction: Instruction) -> Result<()>;

    /// Silence all voices.
    fn stop_all(&self);
}

/// Settings a camera is opened with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraSettings {
    /// (width, height) in pixels
    pub resolution: (u32, u32),
    pub pixel_format: PixelFormat,
    pub exposure_us: f64,
    pub gain_db: f64,
    pub target_fps: f64,
}

impl CameraSettings {
    /// Nominal time between frames at the target rate.
    pub fn frame_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.target_fps)
    }
}

impl From<&CameraConfig> for CameraSettings {
    fn from(config: &CameraConfig) -> Self {
        Self {
            resolution: (config.width, config.height),
            pixel_format: config.pixel_format,
            exposure_us: config.exposure_us,
            gain_db: config.gain_db,
            target_fps: config.target_fps,
        }
    }
}

/// A camera found by [`FrameSource::enumerate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraInfo {
    pub index: usize,
    pub name: String,
}

/// Capability: Continuous Frame Acquisition
///
/// # Contract
/// - `open` configures and starts acquisition; frames queue in the driver
///   from then on, independent of how often `grab` is called
/// - `grab` returns frames in index order; `Ok(None)` on timeout
/// - Frame timestamps use the session clock
/// - `achieved_fps` reports the measured rate, which may be below the target
///
/// # Thread Safety
/// Owned by the capture thread; calls are blocking by design of the grab loop.
pub trait FrameSource: Send {
    /// List cameras this backend can open.
    fn enumerate(&self) -> Result<Vec<CameraInfo>>;

    /// Configure and start acquisition.
    fn open(&mut self, settings: &CameraSettings) -> Result<()>;

    /// Wait up to `timeout` for the next frame.
    fn grab(&mut self, timeout: Duration) -> Result<Option<Frame>>;

    /// Measured acquisition rate.
    fn achieved_fps(&self) -> f64;

    /// Stop acquisition and release the device.
    fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_from_config() {
        let config = CameraConfig {
            target_fps: 250.0,
            ..CameraConfig::default()
        };
        let settings = CameraSettings::from(&config);
        assert_eq!(settings.resolution, (config.width, config.height));
        assert_eq!(settings.frame_period(), Duration::from_millis(4));
    }
}
