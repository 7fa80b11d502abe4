//! Run history
//!
//! Append-only records of what a batch run did: one per task, plus stall,
//! loop, pull request and final summary records.

mod model;
mod store;

pub use model::{Achievements, BatchStatus, HistoryEntry, HistoryKind};
pub use store::{HistorySink, JsonlHistoryStore};
