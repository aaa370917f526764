//! Refresh-count timing for one trial.
//!
//! Every subject-visible duration is converted once to a whole number of
//! display refreshes. Cycle phases are derived so that the end beep lands
//! exactly `imagination_duration` worth of refreshes after the start beep:
//!
//! ```text
//! start beep onset                                    end beep onset
//! |-- start_beep --|-- recording_delay --|-- recording --|-- end_beep --|-- inter - end_beep --|
//! ```

use crate::config::SessionConfig;
use crate::error::{AppResult, SessionError};
use std::time::Duration;

/// Trial durations in display refreshes.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialTiming {
    pub refresh_hz: f64,
    pub training_repetitions: u32,
    pub shape_frames: u64,
    pub blank_frames: u64,
    pub training_to_measurement_frames: u64,
    pub close_eyes_frames: u64,
    pub starting_frames: u64,
    pub cycles: u32,
    pub start_beep_frames: u64,
    pub recording_delay_frames: u64,
    pub recording_frames: u64,
    pub end_beep_frames: u64,
    /// Gap after the end beep until the next start beep
    pub inter_cycle_frames: u64,
    pub post_instruction_frames: u64,
}

fn frames(secs: f64, hz: f64) -> u64 {
    (secs * hz).round().max(0.0) as u64
}

impl TrialTiming {
    /// Convert a validated configuration to refresh counts at `refresh_hz`.
    ///
    /// # Errors
    /// `ConfigValidation` when rounding leaves no refresh for a phase that
    /// must be visible, including an empty recording window.
    pub fn from_config(config: &SessionConfig, refresh_hz: f64) -> AppResult<Self> {
        if !(refresh_hz.is_finite() && refresh_hz > 0.0) {
            return Err(SessionError::ConfigValidation(format!(
                "Invalid refresh rate {} Hz",
                refresh_hz
            )));
        }
        let t = &config.timing;
        let a = &config.audio;

        let imagination_frames = frames(t.imagination_duration, refresh_hz);
        let start_beep_frames = frames(a.start_beep_duration, refresh_hz).max(1);
        let recording_delay_frames = frames(t.recording_delay, refresh_hz);
        let end_beep_frames = frames(a.end_beep_duration, refresh_hz).max(1);
        let recording_frames = imagination_frames
            .checked_sub(start_beep_frames + recording_delay_frames)
            .filter(|n| *n > 0)
            .ok_or_else(|| {
                SessionError::ConfigValidation(format!(
                    "Recording window is empty at {} Hz: imagination {} frames, start beep {} frames, delay {} frames",
                    refresh_hz, imagination_frames, start_beep_frames, recording_delay_frames
                ))
            })?;

        let timing = Self {
            refresh_hz,
            training_repetitions: t.training_repetitions,
            shape_frames: frames(t.training_shape_duration, refresh_hz),
            blank_frames: frames(t.training_blank_duration, refresh_hz),
            training_to_measurement_frames: frames(t.training_to_measurement_delay, refresh_hz),
            close_eyes_frames: frames(t.close_eyes_wait, refresh_hz).max(1),
            starting_frames: frames(t.starting_wait, refresh_hz).max(1),
            cycles: t.imagination_cycles,
            start_beep_frames,
            recording_delay_frames,
            recording_frames,
            end_beep_frames,
            inter_cycle_frames: frames(t.inter_imagination_delay, refresh_hz)
                .saturating_sub(end_beep_frames),
            post_instruction_frames: frames(t.post_instruction_wait, refresh_hz).max(1),
        };

        if timing.training_repetitions > 0 && (timing.shape_frames == 0 || timing.blank_frames == 0) {
            return Err(SessionError::ConfigValidation(format!(
                "Training shape and blank must each last at least one refresh at {} Hz",
                refresh_hz
            )));
        }
        Ok(timing)
    }

    pub fn frame_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.refresh_hz)
    }

    /// Length of `frames` refreshes.
    pub fn duration_of(&self, frames: u64) -> Duration {
        Duration::from_secs_f64(frames as f64 / self.refresh_hz)
    }

    /// Commanded camera window per cycle.
    pub fn recording_window(&self) -> Duration {
        self.duration_of(self.recording_frames)
    }

    /// Start beep to end beep.
    pub fn imagination_frames(&self) -> u64 {
        self.start_beep_frames + self.recording_delay_frames + self.recording_frames
    }

    /// Beeps played per trial: two per training repetition and two per cycle.
    pub fn beeps_per_trial(&self) -> u32 {
        2 * self.training_repetitions + 2 * self.cycles
    }

    /// Total refreshes of one uninterrupted trial.
    pub fn trial_frames(&self) -> u64 {
        let training = u64::from(self.training_repetitions) * (self.shape_frames + self.blank_frames);
        let cycles = u64::from(self.cycles);
        let measurement = cycles * (self.imagination_frames() + self.end_beep_frames)
            + cycles.saturating_sub(1) * self.inter_cycle_frames;
        training
            + self.training_to_measurement_frames
            + self.close_eyes_frames
            + self.starting_frames
            + measurement
            + self.post_instruction_frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timing_at_60hz() {
        let config = SessionConfig::default();
        let timing = TrialTiming::from_config(&config, 60.0).unwrap();
        assert_eq!(timing.start_beep_frames, 18);
        assert_eq!(timing.recording_delay_frames, 60);
        assert_eq!(timing.recording_frames, 522);
        assert_eq!(timing.imagination_frames(), 600);
        assert_eq!(timing.inter_cycle_frames, 300 - 18);
        assert_eq!(timing.beeps_per_trial(), 12);
        assert!((timing.recording_window().as_secs_f64() - 8.7).abs() < 1e-9);
    }

    #[test]
    fn trial_frames_match_the_analytic_estimate() {
        let config = SessionConfig::default();
        let timing = TrialTiming::from_config(&config, 60.0).unwrap();
        let estimate = crate::experiment::queue::SessionQueue::estimated_trial_duration(&config);
        let frames = timing.trial_frames();
        assert_eq!(frames, (estimate.as_secs_f64() * 60.0).round() as u64);
    }

    #[test]
    fn window_that_rounds_away_is_rejected() {
        let mut config = SessionConfig::default();
        config.session.subjects = vec!["Alice".to_string()];
        config.timing.imagination_duration = 1.305;
        config.timing.recording_delay = 1.0;
        config.audio.start_beep_duration = 0.3;
        // 5 ms survives validation but not a 60 Hz display
        assert!(config.validate().is_ok());
        let err = TrialTiming::from_config(&config, 60.0).unwrap_err();
        assert!(matches!(err, SessionError::ConfigValidation(_)));
        assert!(TrialTiming::from_config(&config, 1000.0).is_ok());
    }

    #[test]
    fn invalid_refresh_rate() {
        assert!(TrialTiming::from_config(&SessionConfig::default(), 0.0).is_err());
    }
}
