//! Batch engine
//!
//! Drives an agent through the checkbox tasks of one or more documents,
//! tracking progress in the shared run store and broadcasting snapshots.

mod broadcast;
mod config;
mod context;
mod orchestrator;
mod processor;
pub mod template;
mod worktree;

#[cfg(test)]
pub(crate) mod test_support;

pub use broadcast::{is_significant, BroadcastDebouncer, BroadcastSink, NullBroadcastSink};
pub use config::{env_flag, OrchestratorConfig, DEFAULT_BROADCAST_DEBOUNCE, DEFAULT_STALL_THRESHOLD};
pub use context::RunContext;
pub use orchestrator::{BatchOrchestrator, BatchOutcome, BatchRequest, Collaborators, StalledDocument};
pub use processor::{document_name, DocumentProcessor, TaskInput, TaskRun};
pub use worktree::WorktreeProvider;
