//! Git worktree isolation for batch runs
//!
//! This crate lets a batch run work in its own worktree and branch instead of
//! the main checkout, and opens a pull request from that branch once the run
//! is done. Git and the GitHub CLI are driven as subprocesses.

mod commands;
mod error;
mod pull_request;
mod worktree;

pub use error::{Result, WorktreeError};
pub use pull_request::{build_pr_body, PullRequestOutcome, PullRequestRequest};
pub use worktree::{RunWorktreeManager, Worktree, WorktreeRequest, WorktreeSetup};
