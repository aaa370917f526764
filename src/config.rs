//! Session configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `LSCI_`, nested with `__`
//!    (e.g. `LSCI_TIMING__IMAGINATION_DURATION=12`)
//!
//! Every field carries a serde default so partial files load. Every loader runs
//! [`SessionConfig::validate`] before returning, so a `SessionConfig` obtained from
//! `load_from` or `load_str` always describes a runnable session.
//!
//! # Example
//! ```no_run
//! use lsci_session::config::SessionConfig;
//!
//! let config = SessionConfig::load_from("config/session.toml")?;
//! println!("Recording window: {:.2}s", config.recording_duration());
//! # Ok::<(), lsci_session::error::SessionError>(())
//! ```

use crate::error::{AppResult, SessionError};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

/// Longest accepted duration for any single phase, in seconds.
pub const MAX_PHASE_SECONDS: f64 = 86_400.0;

/// Stimulus shapes shown during training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Shape {
    Circle,
    Square,
    Triangle,
    Star,
}

impl Shape {
    /// Lowercase name used in file names and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Shape::Circle => "circle",
            Shape::Square => "square",
            Shape::Triangle => "triangle",
            Shape::Star => "star",
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level session configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Who is measured and in which order
    #[serde(default)]
    pub session: SessionSettings,
    /// Trial timing (seconds)
    #[serde(default)]
    pub timing: TimingConfig,
    /// Beep synthesis
    #[serde(default)]
    pub audio: AudioConfig,
    /// Camera acquisition
    #[serde(default)]
    pub camera: CameraConfig,
    /// Stimulus display
    #[serde(default)]
    pub display: DisplayConfig,
    /// Engine channel sizing and timeouts
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Subjects, shapes and repetition counts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Subject names in measurement order
    #[serde(default)]
    pub subjects: Vec<String>,
    /// Shapes shown to each subject per turn
    #[serde(default = "default_shapes")]
    pub shapes: Vec<Shape>,
    /// Number of full passes over all subjects
    #[serde(default = "default_one")]
    pub repetitions: u32,
    /// How often the shape list is repeated within one turn
    #[serde(default = "default_one")]
    pub shape_reps_per_subsession: u32,
    /// Parent directory for `session_*` folders
    #[serde(default = "default_output_dir")]
    pub output_base_dir: PathBuf,
}

/// Trial timing, all durations in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_training_repetitions")]
    pub training_repetitions: u32,
    #[serde(default = "default_training_shape_duration")]
    pub training_shape_duration: f64,
    #[serde(default = "default_training_blank_duration")]
    pub training_blank_duration: f64,
    /// Optional blank between training and the instruction sequence (0 = skip)
    #[serde(default)]
    pub training_to_measurement_delay: f64,
    #[serde(default = "default_imagination_cycles")]
    pub imagination_cycles: u32,
    /// Start-beep onset to end-beep onset
    #[serde(default = "default_imagination_duration")]
    pub imagination_duration: f64,
    /// Silence between the end of the start beep and the camera start
    #[serde(default = "default_recording_delay")]
    pub recording_delay: f64,
    /// End-beep onset to the next cycle's start-beep onset
    #[serde(default = "default_inter_imagination_delay")]
    pub inter_imagination_delay: f64,
    #[serde(default = "default_close_eyes_wait")]
    pub close_eyes_wait: f64,
    #[serde(default = "default_starting_wait")]
    pub starting_wait: f64,
    #[serde(default = "default_post_instruction_wait")]
    pub post_instruction_wait: f64,
}

/// Beep synthesis parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Peak amplitude 0..1
    #[serde(default = "default_volume")]
    pub volume: f32,
    /// Fade-in/out length applied to every beep
    #[serde(default = "default_fade_ms")]
    pub fade_ms: f64,
    #[serde(default = "default_start_beep_frequency")]
    pub start_beep_frequency: f64,
    #[serde(default = "default_start_beep_duration")]
    pub start_beep_duration: f64,
    #[serde(default = "default_end_beep_frequency")]
    pub end_beep_frequency: f64,
    #[serde(default = "default_end_beep_duration")]
    pub end_beep_duration: f64,
}

/// Sensor pixel layout delivered by the camera
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// 8-bit grayscale
    Mono8,
    /// 16-bit little-endian grayscale
    Mono16,
}

impl PixelFormat {
    /// Bytes per pixel.
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Mono8 => 1,
            PixelFormat::Mono16 => 2,
        }
    }
}

/// Camera acquisition settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    #[serde(default)]
    pub device_index: usize,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_pixel_format")]
    pub pixel_format: PixelFormat,
    #[serde(default = "default_exposure_us")]
    pub exposure_us: f64,
    #[serde(default)]
    pub gain_db: f64,
    #[serde(default = "default_target_fps")]
    pub target_fps: f64,
    /// Upper bound on a single blocking grab before commands are re-checked
    #[serde(default = "default_grab_timeout_ms")]
    pub grab_timeout_ms: u64,
    /// Capacity of the engine to camera command channel
    #[serde(default = "default_command_capacity")]
    pub command_capacity: usize,
    /// Fraction of the commanded window a recording must cover after frame drops
    #[serde(default = "default_min_recorded_fraction")]
    pub min_recorded_fraction: f64,
}

/// Stimulus display settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayConfig {
    #[serde(default)]
    pub screen_index: usize,
    /// Nominal refresh rate used to convert durations into frame counts
    #[serde(default = "default_refresh_rate")]
    pub refresh_rate_hz: f64,
}

/// Engine channel sizing and timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_intent_capacity")]
    pub intent_capacity: usize,
    #[serde(default = "default_progress_capacity")]
    pub progress_capacity: usize,
    /// How long to wait for outstanding camera acknowledgments at trial end
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
}

// Default value functions
fn default_app_name() -> String {
    "LSCI Imagery Session".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_shapes() -> Vec<Shape> {
    vec![Shape::Circle, Shape::Square, Shape::Triangle, Shape::Star]
}

fn default_one() -> u32 {
    1
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("outputs")
}

fn default_training_repetitions() -> u32 {
    3
}

fn default_training_shape_duration() -> f64 {
    3.0
}

fn default_training_blank_duration() -> f64 {
    2.0
}

fn default_imagination_cycles() -> u32 {
    3
}

fn default_imagination_duration() -> f64 {
    10.0
}

fn default_recording_delay() -> f64 {
    1.0
}

fn default_inter_imagination_delay() -> f64 {
    5.0
}

fn default_close_eyes_wait() -> f64 {
    5.0
}

fn default_starting_wait() -> f64 {
    2.0
}

fn default_post_instruction_wait() -> f64 {
    5.0
}

fn default_sample_rate() -> u32 {
    44_100
}

fn default_volume() -> f32 {
    0.5
}

fn default_fade_ms() -> f64 {
    5.0
}

fn default_start_beep_frequency() -> f64 {
    1000.0
}

fn default_start_beep_duration() -> f64 {
    0.3
}

fn default_end_beep_frequency() -> f64 {
    600.0
}

fn default_end_beep_duration() -> f64 {
    0.3
}

fn default_width() -> u32 {
    640
}

fn default_height() -> u32 {
    480
}

fn default_pixel_format() -> PixelFormat {
    PixelFormat::Mono8
}

fn default_exposure_us() -> f64 {
    1900.0
}

fn default_target_fps() -> f64 {
    500.0
}

fn default_grab_timeout_ms() -> u64 {
    20
}

fn default_command_capacity() -> usize {
    64
}

fn default_min_recorded_fraction() -> f64 {
    0.95
}

fn default_refresh_rate() -> f64 {
    60.0
}

fn default_intent_capacity() -> usize {
    32
}

fn default_progress_capacity() -> usize {
    1024
}

fn default_ack_timeout_ms() -> u64 {
    5000
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            subjects: Vec::new(),
            shapes: default_shapes(),
            repetitions: default_one(),
            shape_reps_per_subsession: default_one(),
            output_base_dir: default_output_dir(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            training_repetitions: default_training_repetitions(),
            training_shape_duration: default_training_shape_duration(),
            training_blank_duration: default_training_blank_duration(),
            training_to_measurement_delay: 0.0,
            imagination_cycles: default_imagination_cycles(),
            imagination_duration: default_imagination_duration(),
            recording_delay: default_recording_delay(),
            inter_imagination_delay: default_inter_imagination_delay(),
            close_eyes_wait: default_close_eyes_wait(),
            starting_wait: default_starting_wait(),
            post_instruction_wait: default_post_instruction_wait(),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            volume: default_volume(),
            fade_ms: default_fade_ms(),
            start_beep_frequency: default_start_beep_frequency(),
            start_beep_duration: default_start_beep_duration(),
            end_beep_frequency: default_end_beep_frequency(),
            end_beep_duration: default_end_beep_duration(),
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            width: default_width(),
            height: default_height(),
            pixel_format: default_pixel_format(),
            exposure_us: default_exposure_us(),
            gain_db: 0.0,
            target_fps: default_target_fps(),
            grab_timeout_ms: default_grab_timeout_ms(),
            command_capacity: default_command_capacity(),
            min_recorded_fraction: default_min_recorded_fraction(),
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            screen_index: 0,
            refresh_rate_hz: default_refresh_rate(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            intent_capacity: default_intent_capacity(),
            progress_capacity: default_progress_capacity(),
            ack_timeout_ms: default_ack_timeout_ms(),
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file and `LSCI_` environment variables,
    /// then validate it.
    ///
    /// Environment variables override file values, sections separated by `__`:
    /// `LSCI_TIMING__RECORDING_DELAY=0.5`
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let figment = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("LSCI_").split("__"));
        Self::from_figment(figment)
    }

    /// Load configuration from an in-memory TOML document and validate it.
    ///
    /// Environment variables are not consulted.
    pub fn load_str(toml: &str) -> AppResult<Self> {
        Self::from_figment(Figment::new().merge(Toml::string(toml)))
    }

    fn from_figment(figment: Figment) -> AppResult<Self> {
        let config: SessionConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Camera recording window per cycle in seconds.
    pub fn recording_duration(&self) -> f64 {
        self.timing.imagination_duration
            - self.audio.start_beep_duration
            - self.timing.recording_delay
    }

    /// Validate configuration after loading.
    ///
    /// All problems are collected and reported together.
    pub fn validate(&self) -> AppResult<()> {
        let mut problems: Vec<String> = Vec::new();

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            problems.push(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }
        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.to_lowercase().as_str()) {
            problems.push(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        self.validate_session(&mut problems);
        self.validate_timing(&mut problems);
        self.validate_audio(&mut problems);
        self.validate_devices(&mut problems);

        if problems.is_empty() {
            Ok(())
        } else {
            Err(SessionError::ConfigValidation(problems.join("; ")))
        }
    }

    fn validate_session(&self, problems: &mut Vec<String>) {
        let s = &self.session;
        if s.subjects.is_empty() {
            problems.push("session.subjects must name at least one subject".to_string());
        }
        let mut seen = HashSet::new();
        for name in &s.subjects {
            if name.trim().is_empty() {
                problems.push("Subject names must not be empty".to_string());
            } else if name.contains(['/', '\\']) || name == "." || name == ".." {
                problems.push(format!("Subject name '{}' is not a valid folder name", name));
            }
            if !seen.insert(name) {
                problems.push(format!("Duplicate subject: {}", name));
            }
        }
        if s.shapes.is_empty() {
            problems.push("session.shapes must list at least one shape".to_string());
        }
        if s.repetitions == 0 {
            problems.push("session.repetitions must be >= 1".to_string());
        }
        if s.shape_reps_per_subsession == 0 {
            problems.push("session.shape_reps_per_subsession must be >= 1".to_string());
        }
    }

    fn validate_timing(&self, problems: &mut Vec<String>) {
        let t = &self.timing;
        let a = &self.audio;
        let durations = [
            ("timing.training_shape_duration", t.training_shape_duration),
            ("timing.training_blank_duration", t.training_blank_duration),
            ("timing.training_to_measurement_delay", t.training_to_measurement_delay),
            ("timing.imagination_duration", t.imagination_duration),
            ("timing.recording_delay", t.recording_delay),
            ("timing.inter_imagination_delay", t.inter_imagination_delay),
            ("timing.close_eyes_wait", t.close_eyes_wait),
            ("timing.starting_wait", t.starting_wait),
            ("timing.post_instruction_wait", t.post_instruction_wait),
            ("audio.start_beep_duration", a.start_beep_duration),
            ("audio.end_beep_duration", a.end_beep_duration),
        ];
        for (name, value) in durations {
            if !value.is_finite() || value < 0.0 {
                problems.push(format!("{} must be a finite duration >= 0 (got {})", name, value));
            } else if value > MAX_PHASE_SECONDS {
                problems.push(format!(
                    "{} of {} s exceeds the {} s limit for one phase",
                    name, value, MAX_PHASE_SECONDS
                ));
            }
        }

        if t.training_repetitions > 0 {
            if t.training_shape_duration <= 0.0 {
                problems.push("timing.training_shape_duration must be > 0".to_string());
            }
            if t.training_blank_duration <= 0.0 {
                problems.push("timing.training_blank_duration must be > 0".to_string());
            }
        }
        if t.imagination_cycles == 0 {
            problems.push("timing.imagination_cycles must be >= 1".to_string());
        }
        if a.start_beep_duration <= 0.0 || a.end_beep_duration <= 0.0 {
            problems.push("Beep durations must be > 0".to_string());
        }

        let window = self.recording_duration();
        if window.is_nan() || window <= 0.0 {
            problems.push(format!(
                "Recording window imagination_duration ({}) - start_beep_duration ({}) - recording_delay ({}) = {:.3}s must be > 0",
                t.imagination_duration, a.start_beep_duration, t.recording_delay, window
            ));
        }
        if t.imagination_cycles > 1 && t.inter_imagination_delay < a.end_beep_duration {
            problems.push(format!(
                "timing.inter_imagination_delay ({}) must cover the end beep ({})",
                t.inter_imagination_delay, a.end_beep_duration
            ));
        }
    }

    fn validate_audio(&self, problems: &mut Vec<String>) {
        let a = &self.audio;
        if a.sample_rate == 0 {
            problems.push("audio.sample_rate must be > 0".to_string());
        }
        if !(0.0..=1.0).contains(&a.volume) {
            problems.push(format!("audio.volume {} must be within 0..1", a.volume));
        }
        if !a.fade_ms.is_finite() || a.fade_ms < 0.0 {
            problems.push("audio.fade_ms must be >= 0".to_string());
        }
        let nyquist = f64::from(a.sample_rate) / 2.0;
        for (name, freq) in [
            ("audio.start_beep_frequency", a.start_beep_frequency),
            ("audio.end_beep_frequency", a.end_beep_frequency),
        ] {
            if freq.is_nan() || freq <= 0.0 || freq >= nyquist {
                problems.push(format!("{} {} Hz must be within 0..{} Hz", name, freq, nyquist));
            }
        }
    }

    fn validate_devices(&self, problems: &mut Vec<String>) {
        let c = &self.camera;
        if c.width == 0 || c.height == 0 {
            problems.push("camera resolution must be non-zero".to_string());
        }
        if !(c.target_fps.is_finite() && c.target_fps > 0.0) {
            problems.push("camera.target_fps must be > 0".to_string());
        }
        if c.command_capacity == 0 {
            problems.push("camera.command_capacity must be > 0".to_string());
        }
        if c.min_recorded_fraction.is_nan()
            || c.min_recorded_fraction <= 0.0
            || c.min_recorded_fraction > 1.0
        {
            problems.push("camera.min_recorded_fraction must be within (0, 1]".to_string());
        }
        if !(self.display.refresh_rate_hz.is_finite() && self.display.refresh_rate_hz > 0.0) {
            problems.push("display.refresh_rate_hz must be > 0".to_string());
        }
        if self.engine.intent_capacity == 0 || self.engine.progress_capacity == 0 {
            problems.push("engine channel capacities must be > 0".to_string());
        }
    }

    /// Write a JSON snapshot of this configuration.
    pub fn save_snapshot<P: AsRef<Path>>(&self, path: P) -> AppResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [session]
        subjects = ["Alice", "Bob"]
    "#;

    #[test]
    fn minimal_file_uses_defaults() {
        let config = SessionConfig::load_str(MINIMAL).unwrap();
        assert_eq!(config.session.subjects, vec!["Alice", "Bob"]);
        assert_eq!(config.session.shapes.len(), 4);
        assert_eq!(config.timing.imagination_cycles, 3);
        assert_eq!(config.audio.sample_rate, 44_100);
        assert!((config.recording_duration() - 8.7).abs() < 1e-9);
    }

    #[test]
    fn rejects_negative_recording_window() {
        let toml = r#"
            [session]
            subjects = ["Alice"]
            [timing]
            imagination_duration = 10.0
            recording_delay = 9.8
            [audio]
            start_beep_duration = 0.3
        "#;
        let err = SessionConfig::load_str(toml).unwrap_err();
        match err {
            SessionError::ConfigValidation(msg) => assert!(msg.contains("Recording window")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn rejects_zero_recording_window() {
        let toml = r#"
            [session]
            subjects = ["Alice"]
            [timing]
            imagination_duration = 2.0
            recording_delay = 1.5
            [audio]
            start_beep_duration = 0.5
        "#;
        assert!(SessionConfig::load_str(toml).is_err());
    }

    #[test]
    fn collects_every_problem() {
        let toml = r#"
            [application]
            log_level = "loud"
            [session]
            subjects = []
            shapes = ["circle"]
            repetitions = 0
        "#;
        let err = SessionConfig::load_str(toml).unwrap_err().to_string();
        assert!(err.contains("log_level"));
        assert!(err.contains("subjects"));
        assert!(err.contains("repetitions"));
    }

    #[test]
    fn rejects_duplicate_subjects() {
        let toml = r#"
            [session]
            subjects = ["Alice", "Alice"]
        "#;
        let err = SessionConfig::load_str(toml).unwrap_err().to_string();
        assert!(err.contains("Duplicate subject"));
    }

    #[test]
    fn rejects_unknown_shape() {
        let toml = r#"
            [session]
            subjects = ["Alice"]
            shapes = ["hexagon"]
        "#;
        match SessionConfig::load_str(toml) {
            Err(SessionError::Config(_)) => {}
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn rejects_durations_longer_than_a_day() {
        let mut config = SessionConfig::load_str(MINIMAL).unwrap();
        config.timing.training_shape_duration = 1e20;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("timing.training_shape_duration"));
        assert!(err.contains("limit"));

        config.timing.training_shape_duration = MAX_PHASE_SECONDS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn inter_delay_must_cover_end_beep() {
        let mut config = SessionConfig::load_str(MINIMAL).unwrap();
        config.timing.inter_imagination_delay = 0.1;
        assert!(config.validate().is_err());
        config.timing.imagination_cycles = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn load_from_file_and_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.toml");
        std::fs::write(&path, MINIMAL).unwrap();

        let config = SessionConfig::load_from(&path).unwrap();
        let snapshot = dir.path().join("session_config.json");
        config.save_snapshot(&snapshot).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&snapshot).unwrap()).unwrap();
        assert_eq!(json["session"]["subjects"][0], "Alice");
        assert_eq!(json["session"]["shapes"][0], "circle");
    }
}
