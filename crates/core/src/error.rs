//! Error types for the core library

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Document not found: {}", .0.display())]
    DocumentNotFound(PathBuf),

    #[error("Backup not found: {}", .0.display())]
    BackupNotFound(PathBuf),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("A batch run is already active for session {0}")]
    RunAlreadyActive(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
