//! Core library for auto-run batch processing
//!
//! This crate contains the pieces of the batch engine that do not talk to
//! external processes:
//! - The batch processing state machine and the per-session run store
//! - Run timing that excludes host suspension
//! - Markdown task documents (checkbox parsing, file store, backups)
//! - History records and the JSONL history store

pub mod batch;
pub mod document;
pub mod error;
pub mod history;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;
