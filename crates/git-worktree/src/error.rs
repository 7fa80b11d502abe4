//! Error types for git-worktree operations

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for worktree operations
pub type Result<T> = std::result::Result<T, WorktreeError>;

/// Errors that can occur while isolating a run or opening its pull request
#[derive(Debug, Error)]
pub enum WorktreeError {
    /// Git command execution failed
    #[error("Git command failed: {message}")]
    GitCommandFailed {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// GitHub CLI execution failed
    #[error("GitHub CLI failed: {message}")]
    GhCommandFailed {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// A worktree already sits at the path but on another branch
    #[error("Worktree at {} is on branch '{actual}', expected '{expected}'", path.display())]
    BranchMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// Branch is checked out in another worktree
    #[error("Branch '{branch}' is already checked out at {}", path.display())]
    BranchCheckedOut { branch: String, path: PathBuf },

    /// Not a git repository
    #[error("Not a git repository: {}", path.display())]
    NotAGitRepository { path: PathBuf },

    /// Path exists and is not a worktree of this repository
    #[error("Invalid worktree path: {}", path.display())]
    InvalidPath { path: PathBuf },

    /// Invalid branch name
    #[error("Invalid branch name: '{branch}'")]
    InvalidBranch { branch: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorktreeError {
    /// Create a GitCommandFailed error
    pub fn git_failed(message: impl Into<String>) -> Self {
        Self::GitCommandFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a GitCommandFailed error with source
    pub fn git_failed_with_source(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::GitCommandFailed {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn gh_failed(message: impl Into<String>) -> Self {
        Self::GhCommandFailed {
            message: message.into(),
            source: None,
        }
    }

    pub fn gh_failed_with_source(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::GhCommandFailed {
            message: message.into(),
            source: Some(source),
        }
    }
}
