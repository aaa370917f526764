//! Session output directory tree.
//!
//! ```text
//! {output_base_dir}/session_YYYY-MM-DD_HH-MM-SS/
//!     session_config.json
//!     event_log.csv
//!     progress.json
//!     subjects/{subject}/rep_{N}/{shape}/
//!         {subject}_{shape}_rep{N}_shapeRep{S}_cycle{C}_{YYYYMMDD_HHMMSS}.avi
//! ```

use crate::config::{SessionConfig, Shape};
use crate::error::AppResult;
use crate::experiment::queue::TrialKey;
use chrono::{DateTime, Local};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// File name of one cycle recording.
pub fn recording_file_name(
    subject: &str,
    shape: Shape,
    repetition: u32,
    shape_rep: u32,
    cycle: u32,
    timestamp: DateTime<Local>,
) -> String {
    format!(
        "{}_{}_rep{}_shapeRep{}_cycle{}_{}.avi",
        subject,
        shape,
        repetition,
        shape_rep,
        cycle,
        timestamp.format("%Y%m%d_%H%M%S")
    )
}

/// Paths of one session's output.
#[derive(Debug, Clone)]
pub struct SessionLayout {
    root: PathBuf,
}

impl SessionLayout {
    /// Create the session directory with one folder per subject, repetition
    /// and shape, and write the configuration snapshot.
    ///
    /// A second session started within the same second gets a numeric suffix.
    pub fn create(config: &SessionConfig, now: DateTime<Local>) -> AppResult<Self> {
        let base = &config.session.output_base_dir;
        fs::create_dir_all(base)?;

        let stamp = now.format("%Y-%m-%d_%H-%M-%S").to_string();
        let mut root = base.join(format!("session_{}", stamp));
        let mut suffix = 2;
        while root.exists() {
            root = base.join(format!("session_{}_{}", stamp, suffix));
            suffix += 1;
        }
        fs::create_dir(&root)?;

        let layout = Self { root };
        for subject in &config.session.subjects {
            for repetition in 1..=config.session.repetitions {
                for shape in &config.session.shapes {
                    fs::create_dir_all(layout.shape_dir(subject, repetition, *shape))?;
                }
            }
        }
        config.save_snapshot(layout.config_path())?;
        info!(root = ?layout.root, "Session directory created");
        Ok(layout)
    }

    /// Layout of an existing session directory.
    pub fn open<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// `session_YYYY-MM-DD_HH-MM-SS` directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// JSON snapshot of the configuration the session ran with.
    pub fn config_path(&self) -> PathBuf {
        self.root.join("session_config.json")
    }

    /// CSV event log.
    pub fn event_log_path(&self) -> PathBuf {
        self.root.join("event_log.csv")
    }

    /// Progress checkpoint, rewritten after each completed trial.
    pub fn progress_path(&self) -> PathBuf {
        self.root.join("progress.json")
    }

    /// `subjects/{subject}/rep_{N}/{shape}` under the session root.
    pub fn shape_dir(&self, subject: &str, repetition: u32, shape: Shape) -> PathBuf {
        self.root
            .join("subjects")
            .join(subject)
            .join(format!("rep_{}", repetition))
            .join(shape.as_str())
    }

    /// Full path of a cycle recording for `key`.
    pub fn recording_path(&self, key: &TrialKey, cycle: u32, timestamp: DateTime<Local>) -> PathBuf {
        self.shape_dir(&key.subject, key.repetition, key.shape)
            .join(recording_file_name(
                &key.subject,
                key.shape,
                key.repetition,
                key.shape_rep,
                cycle,
                timestamp,
            ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn noon() -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 3, 14, 12, 5, 9).unwrap()
    }

    #[test]
    fn recording_name_follows_the_contract() {
        let name = recording_file_name("Alice", Shape::Circle, 1, 1, 2, noon());
        assert_eq!(name, "Alice_circle_rep1_shapeRep1_cycle2_20260314_120509.avi");
    }

    #[test]
    fn creates_the_tree_and_snapshot() {
        let dir = tempdir().unwrap();
        let mut config = SessionConfig::default();
        config.session.subjects = vec!["Alice".to_string(), "Bob".to_string()];
        config.session.shapes = vec![Shape::Circle, Shape::Square];
        config.session.repetitions = 2;
        config.session.output_base_dir = dir.path().to_path_buf();

        let layout = SessionLayout::create(&config, noon()).unwrap();
        assert!(layout.root().ends_with("session_2026-03-14_12-05-09"));
        assert!(layout.config_path().is_file());
        for subject in ["Alice", "Bob"] {
            for rep in 1..=2 {
                assert!(layout.shape_dir(subject, rep, Shape::Square).is_dir());
            }
        }

        let key = TrialKey {
            subject: "Bob".to_string(),
            shape: Shape::Square,
            repetition: 2,
            shape_rep: 1,
        };
        let path = layout.recording_path(&key, 3, noon());
        assert_eq!(
            path,
            layout
                .root()
                .join("subjects/Bob/rep_2/square/Bob_square_rep2_shapeRep1_cycle3_20260314_120509.avi")
        );

        let again = SessionLayout::create(&config, noon()).unwrap();
        assert!(again.root().ends_with("session_2026-03-14_12-05-09_2"));
    }
}
