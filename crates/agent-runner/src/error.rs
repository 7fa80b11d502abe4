//! Error types for agent-runner

use thiserror::Error;

/// Result type alias for executor operations
pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Errors that can occur while running a batch
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Document, history or run store failure
    #[error(transparent)]
    Core(#[from] autorun_core::Error),

    /// Worktree operation failed
    #[error("Worktree error: {0}")]
    Worktree(#[from] git_worktree::WorktreeError),

    /// Failed to spawn agent process
    #[error("Failed to spawn agent process: {message}")]
    SpawnFailed {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Agent process exited unexpectedly
    #[error("Agent process exited with code {code:?}: {message}")]
    ProcessExited { code: Option<i32>, message: String },

    /// Invalid agent type
    #[error("Invalid agent type: {agent_type}")]
    InvalidAgentType { agent_type: String },

    /// Agent call timeout
    #[error("Agent timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    /// No batch run for the session
    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: String },

    /// A batch run is already in progress for the session
    #[error("A batch run already exists for session {session_id}")]
    SessionExists { session_id: String },

    /// The session's run is not waiting on an error
    #[error("Session {session_id} is not paused on an error")]
    NotPaused { session_id: String },

    /// The session's run cannot take the request in its current state
    #[error("Session {session_id} is not running")]
    NotRunning { session_id: String },

    /// Working directory could not be prepared
    #[error("Batch setup failed: {message}")]
    SetupFailed { message: String },

    /// Request rejected before anything started
    #[error("Invalid batch request: {message}")]
    InvalidRequest { message: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecutorError {
    /// Create a SpawnFailed error
    pub fn spawn_failed(message: impl Into<String>) -> Self {
        Self::SpawnFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a SpawnFailed error with source
    pub fn spawn_failed_with_source(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::SpawnFailed {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }
}
