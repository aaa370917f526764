//! # LSCI Imagery Session Controller
//!
//! Runs visual-imagery experiments in which a subject is trained on a shape,
//! closes their eyes, and imagines it while a laser speckle contrast imaging
//! camera records one file per imagination cycle.
//!
//! ## Crate Structure
//!
//! - **`config`**: Session configuration loaded with `figment` from TOML and
//!   `LSCI_` environment variables, plus validation.
//! - **`error`**: The `SessionError` enum shared by every module.
//! - **`hardware`**: Capability traits for the stimulus display, audio output
//!   and camera, the capture-thread coordinator, and mock devices.
//! - **`experiment`**: The session queue, per-trial protocol and the engine
//!   that runs them.
//! - **`data`**: Output directory layout and the CSV event log.
//! - **`messages`**: Intents, notifications and camera commands exchanged
//!   between contexts.
//! - **`tracing_setup`**: Structured logging initialization.

pub mod config;
pub mod data;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod messages;
pub mod tracing_setup;

pub use error::{AppResult, SessionError};
