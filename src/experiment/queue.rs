//! Ordered trial queue.
//!
//! The queue is expanded once from the session configuration and never
//! reordered. Loop nesting, outermost first:
//!
//! ```text
//! repetition -> subject -> shape rep -> shape
//! ```
//!
//! so every shape of one subject's repetition forms a single uninterrupted
//! turn, and every subject finishes a repetition before the next one starts.
//! Interrupted trials go back to `Pending` in place and are served again by
//! [`SessionQueue::next`] before anything behind them.

use crate::config::{SessionConfig, Shape};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Position of a trial in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrialId(pub usize);

impl fmt::Display for TrialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0 + 1)
    }
}

/// Identity of a trial. Indices are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrialKey {
    pub subject: String,
    pub shape: Shape,
    pub repetition: u32,
    pub shape_rep: u32,
}

impl fmt::Display for TrialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} rep{} shapeRep{}",
            self.subject, self.shape, self.repetition, self.shape_rep
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrialStatus {
    Pending,
    Running,
    /// Stopped by the operator; never served again
    Interrupted,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Trial {
    pub id: TrialId,
    pub key: TrialKey,
    pub cycles: u32,
    pub status: TrialStatus,
}

/// The session's trial sequence with per-trial status.
#[derive(Debug, Clone)]
pub struct SessionQueue {
    trials: Vec<Trial>,
}

impl SessionQueue {
    /// Expand subjects × repetitions × shapes × shape reps into trials.
    pub fn build(config: &SessionConfig) -> Self {
        let s = &config.session;
        let cycles = config.timing.imagination_cycles;
        let mut trials = Vec::with_capacity(
            s.subjects.len()
                * s.shapes.len()
                * s.repetitions as usize
                * s.shape_reps_per_subsession as usize,
        );
        for repetition in 1..=s.repetitions {
            for subject in &s.subjects {
                for shape_rep in 1..=s.shape_reps_per_subsession {
                    for shape in &s.shapes {
                        trials.push(Trial {
                            id: TrialId(trials.len()),
                            key: TrialKey {
                                subject: subject.clone(),
                                shape: *shape,
                                repetition,
                                shape_rep,
                            },
                            cycles,
                            status: TrialStatus::Pending,
                        });
                    }
                }
            }
        }
        debug!(trials = trials.len(), "Session queue built");
        Self { trials }
    }

    /// First pending trial in queue order, or `None` when exhausted.
    pub fn next(&self) -> Option<&Trial> {
        self.trials.iter().find(|t| t.status == TrialStatus::Pending)
    }

    pub fn get(&self, id: TrialId) -> Option<&Trial> {
        self.trials.get(id.0)
    }

    pub fn trials(&self) -> &[Trial] {
        &self.trials
    }

    fn set(&mut self, id: TrialId, status: TrialStatus) {
        if let Some(trial) = self.trials.get_mut(id.0) {
            debug!(trial = %id, from = ?trial.status, to = ?status, "Trial status");
            trial.status = status;
        }
    }

    /// Mark a trial Running. Any other Running trial is reset to Pending so
    /// at most one trial runs at a time.
    pub fn mark_running(&mut self, id: TrialId) {
        for trial in &mut self.trials {
            if trial.status == TrialStatus::Running && trial.id != id {
                trial.status = TrialStatus::Pending;
            }
        }
        self.set(id, TrialStatus::Running);
    }

    pub fn mark_completed(&mut self, id: TrialId) {
        self.set(id, TrialStatus::Completed);
    }

    /// Paused trial: back to Pending at its original position.
    pub fn mark_interrupted(&mut self, id: TrialId) {
        self.set(id, TrialStatus::Pending);
    }

    /// Trial cut short by Stop; it is not served again.
    pub fn mark_stopped(&mut self, id: TrialId) {
        self.set(id, TrialStatus::Interrupted);
    }

    pub fn mark_failed(&mut self, id: TrialId) {
        self.set(id, TrialStatus::Failed);
    }

    /// Whether no later trial belongs to the same subject and repetition.
    pub fn is_last_in_turn(&self, id: TrialId) -> bool {
        match (self.trials.get(id.0), self.trials.get(id.0 + 1)) {
            (Some(current), Some(next)) => {
                current.key.subject != next.key.subject
                    || current.key.repetition != next.key.repetition
            }
            _ => true,
        }
    }

    /// Whether the trial is the final queue entry.
    pub fn is_last(&self, id: TrialId) -> bool {
        id.0 + 1 >= self.trials.len()
    }

    /// Whether `id` starts a new turn relative to the trial before it.
    pub fn starts_turn(&self, id: TrialId) -> bool {
        id.0 == 0 || self.is_last_in_turn(TrialId(id.0 - 1))
    }

    /// 1-based position.
    pub fn position(&self, id: TrialId) -> usize {
        id.0 + 1
    }

    pub fn total(&self) -> usize {
        self.trials.len()
    }

    pub fn completed(&self) -> usize {
        self.count(TrialStatus::Completed)
    }

    pub fn remaining(&self) -> usize {
        self.count(TrialStatus::Pending) + self.count(TrialStatus::Running)
    }

    fn count(&self, status: TrialStatus) -> usize {
        self.trials.iter().filter(|t| t.status == status).count()
    }

    /// Nominal length of one trial, derived from configuration only.
    pub fn estimated_trial_duration(config: &SessionConfig) -> Duration {
        let t = &config.timing;
        let training = f64::from(t.training_repetitions)
            * (t.training_shape_duration + t.training_blank_duration);
        let instructions = t.training_to_measurement_delay + t.close_eyes_wait + t.starting_wait;
        let cycles = f64::from(t.imagination_cycles);
        let measurement = cycles * t.imagination_duration
            + (cycles - 1.0).max(0.0) * t.inter_imagination_delay
            + config.audio.end_beep_duration;
        let secs = training + instructions + measurement + t.post_instruction_wait;
        // Saturates instead of panicking on durations no clock can represent
        Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
    }

    /// Nominal time still needed for every pending or running trial.
    pub fn estimated_remaining(&self, config: &SessionConfig) -> Duration {
        let trials = u32::try_from(self.remaining()).unwrap_or(u32::MAX);
        Self::estimated_trial_duration(config).saturating_mul(trials)
    }

    /// Wall-clock end time if the remaining trials run back to back from `now`.
    pub fn estimated_end_time(&self, config: &SessionConfig, now: DateTime<Local>) -> DateTime<Local> {
        let remaining = self.estimated_remaining(config);
        chrono::Duration::from_std(remaining)
            .ok()
            .and_then(|delta| now.checked_add_signed(delta))
            .unwrap_or(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(subjects: &[&str], shapes: &[Shape], repetitions: u32, shape_reps: u32) -> SessionConfig {
        let mut config = SessionConfig::default();
        config.session.subjects = subjects.iter().map(|s| s.to_string()).collect();
        config.session.shapes = shapes.to_vec();
        config.session.repetitions = repetitions;
        config.session.shape_reps_per_subsession = shape_reps;
        config
    }

    fn labels(queue: &SessionQueue) -> Vec<String> {
        queue
            .trials()
            .iter()
            .map(|t| format!("{}-{}(r{})", t.key.subject, t.key.shape, t.key.repetition))
            .collect()
    }

    #[test]
    fn turns_are_contiguous_and_subjects_alternate_per_repetition() {
        let queue = SessionQueue::build(&config(&["A", "B"], &[Shape::Circle, Shape::Square], 2, 1));
        assert_eq!(
            labels(&queue),
            vec![
                "A-circle(r1)",
                "A-square(r1)",
                "B-circle(r1)",
                "B-square(r1)",
                "A-circle(r2)",
                "A-square(r2)",
                "B-circle(r2)",
                "B-square(r2)",
            ]
        );
    }

    #[test]
    fn shape_reps_repeat_the_shape_list_within_a_turn() {
        let queue = SessionQueue::build(&config(&["A"], &[Shape::Circle, Shape::Star], 1, 2));
        let keys: Vec<(Shape, u32)> = queue.trials().iter().map(|t| (t.key.shape, t.key.shape_rep)).collect();
        assert_eq!(
            keys,
            vec![(Shape::Circle, 1), (Shape::Star, 1), (Shape::Circle, 2), (Shape::Star, 2)]
        );
        assert!(!queue.is_last_in_turn(TrialId(2)));
        assert!(queue.is_last_in_turn(TrialId(3)));
    }

    #[test]
    fn interrupted_trial_is_retried_in_place() {
        let mut queue = SessionQueue::build(&config(&["A", "B"], &[Shape::Circle], 1, 1));
        let first = queue.next().unwrap().id;
        queue.mark_running(first);
        queue.mark_interrupted(first);
        assert_eq!(queue.next().unwrap().id, first);

        queue.mark_running(first);
        queue.mark_completed(first);
        let second = queue.next().unwrap().id;
        assert_eq!(second, TrialId(1));
        queue.mark_running(second);
        queue.mark_stopped(second);
        assert!(queue.next().is_none());
        assert_eq!(queue.completed(), 1);
    }

    #[test]
    fn only_one_trial_runs() {
        let mut queue = SessionQueue::build(&config(&["A"], &[Shape::Circle, Shape::Square], 1, 1));
        queue.mark_running(TrialId(0));
        queue.mark_running(TrialId(1));
        let running: Vec<_> = queue
            .trials()
            .iter()
            .filter(|t| t.status == TrialStatus::Running)
            .collect();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, TrialId(1));
    }

    #[test]
    fn turn_boundaries() {
        let queue = SessionQueue::build(&config(&["A", "B"], &[Shape::Circle, Shape::Square], 1, 1));
        assert!(queue.starts_turn(TrialId(0)));
        assert!(!queue.starts_turn(TrialId(1)));
        assert!(queue.starts_turn(TrialId(2)));
        assert!(queue.is_last_in_turn(TrialId(1)));
        assert!(queue.is_last(TrialId(3)));
        assert!(!queue.is_last(TrialId(2)));
    }

    #[test]
    fn estimate_saturates_on_absurd_durations() {
        let mut cfg = config(&["A", "B"], &[Shape::Circle], 1, 1);
        cfg.timing.training_shape_duration = 1e20;
        let queue = SessionQueue::build(&cfg);
        assert_eq!(SessionQueue::estimated_trial_duration(&cfg), Duration::MAX);
        assert_eq!(queue.estimated_remaining(&cfg), Duration::MAX);
        let now = Local::now();
        assert_eq!(queue.estimated_end_time(&cfg, now), now);
    }

    #[test]
    fn estimate_is_analytic() {
        let mut cfg = config(&["A"], &[Shape::Circle, Shape::Square], 1, 1);
        cfg.timing.training_repetitions = 2;
        cfg.timing.training_shape_duration = 3.0;
        cfg.timing.training_blank_duration = 2.0;
        cfg.timing.imagination_cycles = 3;
        cfg.timing.imagination_duration = 10.0;
        cfg.timing.inter_imagination_delay = 5.0;
        cfg.timing.close_eyes_wait = 5.0;
        cfg.timing.starting_wait = 2.0;
        cfg.timing.post_instruction_wait = 5.0;
        cfg.audio.end_beep_duration = 0.5;

        // 10 + 0 + 5 + 2 + 30 + 10 + 0.5 + 5
        let per_trial = SessionQueue::estimated_trial_duration(&cfg);
        assert_eq!(per_trial, Duration::from_secs_f64(62.5));

        let mut queue = SessionQueue::build(&cfg);
        assert_eq!(queue.estimated_remaining(&cfg), per_trial * 2);
        queue.mark_completed(TrialId(0));
        assert_eq!(queue.estimated_remaining(&cfg), per_trial);

        let now = Local::now();
        let end = queue.estimated_end_time(&cfg, now);
        assert_eq!((end - now).num_milliseconds(), 62_500);
    }
}
