//! Session output: directory layout and the event log.
pub mod event_log;
pub mod layout;

pub use event_log::{CsvEventLog, EventKind, EventStatus, MemorySink, PersistenceSink, SessionEvent};
pub use layout::SessionLayout;
