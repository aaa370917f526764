//! Hardware abstractions for the session controller.
//!
//! - [`capabilities`]: the traits the engine drives (display, audio, camera)
//! - [`camera`]: the capture-thread coordinator that owns a [`capabilities::FrameSource`]
//! - [`tone`]: exact-sample-count beep synthesis
//! - [`avi`]: uncompressed grayscale AVI writer used for per-cycle recordings
//! - [`mock`]: simulated devices for tests and dry runs

pub mod avi;
pub mod camera;
pub mod capabilities;
pub mod mock;
pub mod tone;

pub use camera::{CameraCoordinator, CameraHandle, CameraStatus, CaptureMode};
pub use capabilities::{AudioOutput, FrameSource, StimulusDisplay};
pub use tone::ToneBuffer;

use crate::config::{PixelFormat, Shape};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Session time source shared by the engine and the capture thread.
///
/// Timestamps are offsets from the clock's epoch, so refresh ticks and camera
/// frames can be compared directly.
pub trait Clock: Send + Sync {
    /// Time elapsed since the clock epoch.
    fn now(&self) -> Duration;
}

/// Wall-clock time source backed by [`Instant`].
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    /// Start a clock whose epoch is now.
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }
}

/// Virtual clock advanced explicitly, used to run sessions faster than real time.
#[derive(Debug, Clone, Default)]
pub struct SimClock {
    nanos: Arc<AtomicU64>,
}

impl SimClock {
    /// Virtual clock at t = 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }

    /// Jump to an absolute time; never moves backwards.
    pub fn set(&self, to: Duration) {
        self.nanos.fetch_max(to.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Clock for SimClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }
}

/// One display refresh (vertical blank) as observed by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshTick {
    /// Refresh counter since the display was opened
    pub index: u64,
    /// Session-clock time at which the new frame became visible
    pub timestamp: Duration,
}

/// Spoken instructions played between training and measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Instruction {
    CloseYourEyes,
    Starting,
    OpenYourEyes,
    NextParticipant,
    ExperimentCompleted,
}

impl Instruction {
    /// Name of the prerecorded clip.
    pub fn clip_name(&self) -> &'static str {
        match self {
            Instruction::CloseYourEyes => "close_your_eyes",
            Instruction::Starting => "starting",
            Instruction::OpenYourEyes => "open_your_eyes",
            Instruction::NextParticipant => "next_participant_please",
            Instruction::ExperimentCompleted => "experiment_completed",
        }
    }
}

/// Beep cues synthesized once per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cue {
    /// Start imagining
    StartBeep,
    /// Stop imagining
    EndBeep,
}

/// What the subject currently sees; mirrored to the operator surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StimulusView {
    Idle,
    Blank,
    Shape(Shape),
    Instruction(Instruction),
    /// Eyes-closed measurement screen
    Recording,
}

impl fmt::Display for StimulusView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StimulusView::Idle => write!(f, "idle"),
            StimulusView::Blank => write!(f, "blank"),
            StimulusView::Shape(shape) => write!(f, "shape:{}", shape),
            StimulusView::Instruction(i) => write!(f, "instruction:{}", i.clip_name()),
            StimulusView::Recording => write!(f, "recording"),
        }
    }
}

/// A single camera frame.
///
/// 8-bit formats carry one byte per pixel, 16-bit formats two bytes little endian.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Sequence number assigned by the sensor; gaps mean dropped frames
    pub index: u64,
    /// Session-clock exposure time
    pub timestamp: Duration,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Pixel layout of `data`
    pub pixel_format: PixelFormat,
    /// Raw pixel data
    pub data: Vec<u8>,
}

impl Frame {
    /// Create a frame from 8-bit pixel data.
    pub fn from_u8(index: u64, timestamp: Duration, width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            index,
            timestamp,
            width,
            height,
            pixel_format: PixelFormat::Mono8,
            data,
        }
    }

    /// Create a frame from 16-bit pixel data.
    pub fn from_u16(index: u64, timestamp: Duration, width: u32, height: u32, pixels: &[u16]) -> Self {
        let mut data = Vec::with_capacity(pixels.len() * 2);
        for pixel in pixels {
            data.extend_from_slice(&pixel.to_le_bytes());
        }
        Self {
            index,
            timestamp,
            width,
            height,
            pixel_format: PixelFormat::Mono16,
            data,
        }
    }

    /// Expected byte length for the frame geometry.
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.pixel_format.bytes_per_pixel()
    }

    /// 8-bit view of the frame; 16-bit pixels keep their high byte.
    pub fn to_mono8(&self) -> Vec<u8> {
        match self.pixel_format {
            PixelFormat::Mono8 => self.data.clone(),
            PixelFormat::Mono16 => self
                .data
                .chunks_exact(2)
                .map(|px| u16::from_le_bytes([px[0], px[1]]).to_be_bytes()[0])
                .collect(),
        }
    }
}
