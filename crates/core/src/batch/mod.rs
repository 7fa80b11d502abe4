//! Batch run state
//!
//! The pure processing state machine, the per-session run record built on
//! top of it, and the run time tracker.

mod model;
pub mod state_machine;
mod store;
mod time_tracker;

pub use model::{
    AgentError, AgentErrorKind, BatchRun, BatchRunError, DocumentEntry, ErrorResolution,
    ProgressSnapshot, ProgressUpdate, RunTiming, StartBatchParams, UsageStats, WorktreeInfo,
};
pub use state_machine::{
    can_transition, next_state, transition, BatchEvent, BatchEventKind, ProcessingState,
};
pub use store::{BatchStateStore, Dispatch, StoreObserver};
pub use time_tracker::TimeTracker;
