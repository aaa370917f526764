//! Beep synthesis.
//!
//! Beeps are generated once per session as fixed-length sample buffers, so a
//! beep's audible length is exact in the audio clock domain no matter how the
//! playback call is scheduled.

use crate::config::AudioConfig;

/// Mono `f32` sample buffer with an exact sample count.
#[derive(Debug, Clone, PartialEq)]
pub struct ToneBuffer {
    sample_rate: u32,
    samples: Vec<f32>,
}

impl ToneBuffer {
    /// Sine tone of `duration_s` seconds with linear fade-in/out.
    ///
    /// The buffer holds exactly `round(sample_rate * duration_s)` samples. The
    /// fade is applied only when the tone is longer than both fades together.
    pub fn sine(frequency: f64, duration_s: f64, sample_rate: u32, volume: f32, fade_ms: f64) -> Self {
        let rate = f64::from(sample_rate);
        let n_samples = (rate * duration_s).max(0.0).round() as usize;
        let step = 2.0 * std::f64::consts::PI * frequency / rate;

        let mut samples: Vec<f32> = (0..n_samples)
            .map(|i| volume * (step * i as f64).sin() as f32)
            .collect();

        let fade = (rate * fade_ms / 1000.0).max(0.0) as usize;
        if fade > 1 && n_samples > 2 * fade {
            let last = (fade - 1) as f32;
            for i in 0..fade {
                let gain = i as f32 / last;
                samples[i] *= gain;
                samples[n_samples - 1 - i] *= gain;
            }
        }

        Self {
            sample_rate,
            samples,
        }
    }

    /// Start beep as configured.
    pub fn start_beep(config: &AudioConfig) -> Self {
        Self::sine(
            config.start_beep_frequency,
            config.start_beep_duration,
            config.sample_rate,
            config.volume,
            config.fade_ms,
        )
    }

    /// End beep as configured.
    pub fn end_beep(config: &AudioConfig) -> Self {
        Self::sine(
            config.end_beep_frequency,
            config.end_beep_duration,
            config.sample_rate,
            config.volume,
            config.fade_ms,
        )
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback length derived from the sample count.
    pub fn duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_count_is_exact() {
        let tone = ToneBuffer::sine(1000.0, 0.3, 44_100, 0.5, 5.0);
        assert_eq!(tone.len(), 13_230);
        let tone = ToneBuffer::sine(440.0, 0.25, 48_000, 0.5, 0.0);
        assert_eq!(tone.len(), 12_000);
    }

    #[test]
    fn fades_start_and_end_at_zero() {
        let tone = ToneBuffer::sine(1000.0, 0.1, 44_100, 1.0, 5.0);
        let samples = tone.samples();
        assert_eq!(samples[0], 0.0);
        assert_eq!(*samples.last().unwrap(), 0.0);
        let peak = samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!(peak > 0.99 && peak <= 1.0);
    }

    #[test]
    fn short_tones_skip_the_fade() {
        // 2 ms tone is shorter than two 5 ms fades
        let tone = ToneBuffer::sine(1000.0, 0.002, 44_100, 1.0, 5.0);
        assert_eq!(tone.len(), 88);
        assert!(tone.samples()[1].abs() > 0.1);
    }
}
