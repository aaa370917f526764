//! Trial scheduling and execution.
//!
//! - [`queue`]: ordered list of trials and their status
//! - [`timing`]: configuration seconds converted to display refreshes
//! - [`protocol`]: refresh-locked state machine for one trial
//! - [`engine`]: session orchestrator driven by operator intents
//! - [`state`]: engine lifecycle states and the progress checkpoint

pub mod engine;
pub mod protocol;
pub mod queue;
pub mod state;
pub mod timing;

pub use engine::{EngineHandle, ExperimentEngine, SessionHardware, SessionSummary};
pub use protocol::{CycleRecord, CycleStatus, TrialPhase, TrialProtocol};
pub use queue::{SessionQueue, Trial, TrialId, TrialKey, TrialStatus};
pub use state::{ExperimentState, ProgressCheckpoint, TrialSummary};
pub use timing::TrialTiming;
