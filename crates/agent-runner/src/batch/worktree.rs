//! Worktree seam used by the orchestrator

use std::path::Path;

use async_trait::async_trait;
use git_worktree::{
    PullRequestOutcome, PullRequestRequest, RunWorktreeManager, WorktreeRequest, WorktreeSetup,
};

/// Prepares the directory a run works in and opens its pull request
///
/// Neither operation fails; problems are reported in the returned value.
#[async_trait]
pub trait WorktreeProvider: Send + Sync {
    async fn setup(&self, base_cwd: &Path, request: Option<&WorktreeRequest>) -> WorktreeSetup;

    async fn create_pull_request(
        &self,
        worktree_path: &Path,
        request: &PullRequestRequest,
    ) -> PullRequestOutcome;
}

#[async_trait]
impl WorktreeProvider for RunWorktreeManager {
    async fn setup(&self, base_cwd: &Path, request: Option<&WorktreeRequest>) -> WorktreeSetup {
        RunWorktreeManager::setup(self, base_cwd, request).await
    }

    async fn create_pull_request(
        &self,
        worktree_path: &Path,
        request: &PullRequestRequest,
    ) -> PullRequestOutcome {
        RunWorktreeManager::create_pull_request(self, worktree_path, request).await
    }
}
