//! Task documents
//!
//! Markdown files whose checkboxes are the unit of work of a batch run.

pub mod checkbox;
mod file_store;
mod repository;

pub use checkbox::{count_tasks, first_unchecked_task, uncheck_all, TaskCounts};
pub use file_store::{backup_path, document_path, FileDocumentStore, BACKUP_SUFFIX};
pub use repository::DocumentRepository;
