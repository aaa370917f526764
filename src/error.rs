//! Custom error types for the session controller.
//!
//! This module defines the primary error type, `SessionError`, used across the crate.
//! Using the `thiserror` crate, it gives a single place where every failure a session
//! can hit is named, from configuration problems found before the first trial to
//! camera I/O failures in the middle of a recording.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically TOML syntax or type mismatches
//!   in the configuration file or environment overrides.
//! - **`ConfigValidation`**: Semantic errors in a configuration that parsed correctly,
//!   such as a non-positive recording window. Always fatal before the session starts.
//! - **`HardwareUnavailable`**: The display, audio output or camera could not be used
//!   when the session was prepared. Fatal before any trial begins.
//! - **`RecordingFailure`**: A camera start/stop acknowledgment reported an I/O or
//!   capture failure mid-trial. The trial becomes `Failed` and the engine halts.
//! - **`Io`**, **`Serialization`**, **`EventLog`**: Wrappers for the persistence layer.
//! - **`ChannelClosed`**: A cross-context channel was dropped by its peer.
//!
//! Operator pauses are not errors; they are state transitions of the trial protocol.

use thiserror::Error;

/// Convenience alias for results using the session error type.
pub type AppResult<T> = std::result::Result<T, SessionError>;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    ConfigValidation(String),

    #[error("Hardware unavailable: {0}")]
    HardwareUnavailable(String),

    #[error("Recording failure: {0}")]
    RecordingFailure(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Event log error: {0}")]
    EventLog(#[from] csv::Error),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),
}

impl From<figment::Error> for SessionError {
    fn from(value: figment::Error) -> Self {
        SessionError::Config(Box::new(value))
    }
}

impl SessionError {
    /// Whether the session can continue after this error once the operator has
    /// acknowledged it.
    ///
    /// Configuration and hardware errors are terminal. Persistence hiccups are
    /// reported but do not invalidate the recordings already on disk.
    pub fn is_recoverable(&self) -> bool {
        match self {
            SessionError::Config(_)
            | SessionError::ConfigValidation(_)
            | SessionError::HardwareUnavailable(_)
            | SessionError::RecordingFailure(_)
            | SessionError::ChannelClosed(_) => false,
            SessionError::Io(_) | SessionError::Serialization(_) | SessionError::EventLog(_) => {
                true
            }
        }
    }
}
