//! Worktree isolation for batch runs

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::commands::{
    branch_exists, get_repo_root, git_command_checked, is_git_repository, is_valid_branch_name,
};
use crate::error::{Result, WorktreeError};

/// Where and on which branch a run wants to work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeRequest {
    /// Worktree location; relative paths are resolved against the repository root
    pub path: PathBuf,
    pub branch: String,
    /// Starting point for a new branch, `HEAD` of the main checkout when unset
    #[serde(default)]
    pub base_branch: Option<String>,
    #[serde(default)]
    pub create_pr_on_completion: bool,
    /// Branch the pull request targets, the remote's default branch when unset
    #[serde(default)]
    pub pr_target_branch: Option<String>,
    #[serde(default)]
    pub draft_pr: bool,
}

/// A worktree of the repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worktree {
    /// Absolute path to the worktree
    pub path: PathBuf,
    /// Branch checked out in the worktree, empty when detached
    pub branch: String,
    /// Commit hash at the HEAD of this worktree
    pub head: String,
    /// Whether this is the main checkout
    pub is_main: bool,
}

/// Result of preparing a run's working directory
///
/// Never an error: failures are reported through `success` and `error`, and
/// `effective_cwd` then falls back to the main checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeSetup {
    pub success: bool,
    pub effective_cwd: PathBuf,
    pub active: bool,
    pub path: Option<PathBuf>,
    pub branch: Option<String>,
    pub error: Option<String>,
}

impl WorktreeSetup {
    /// Work directly in the main checkout
    pub fn main_checkout(cwd: impl Into<PathBuf>) -> Self {
        Self {
            success: true,
            effective_cwd: cwd.into(),
            active: false,
            path: None,
            branch: None,
            error: None,
        }
    }

    pub fn failed(cwd: impl Into<PathBuf>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::main_checkout(cwd)
        }
    }

    fn isolated(worktree: &Worktree) -> Self {
        Self {
            success: true,
            effective_cwd: worktree.path.clone(),
            active: true,
            path: Some(worktree.path.clone()),
            branch: Some(worktree.branch.clone()),
            error: None,
        }
    }
}

fn path_arg(path: &Path) -> Result<&str> {
    path.to_str().ok_or_else(|| WorktreeError::InvalidPath {
        path: path.to_path_buf(),
    })
}

async fn normalize(path: &Path) -> PathBuf {
    tokio::fs::canonicalize(path)
        .await
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Creates, reuses and publishes the worktrees batch runs work in
#[derive(Debug, Clone)]
pub struct RunWorktreeManager {
    pub(crate) remote: String,
}

impl Default for RunWorktreeManager {
    fn default() -> Self {
        Self {
            remote: "origin".to_string(),
        }
    }
}

impl RunWorktreeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a remote other than `origin` for pushes
    pub fn with_remote(remote: impl Into<String>) -> Self {
        Self {
            remote: remote.into(),
        }
    }

    /// Resolve the directory a run works in
    pub async fn setup(&self, base_cwd: &Path, request: Option<&WorktreeRequest>) -> WorktreeSetup {
        let Some(request) = request else {
            return WorktreeSetup::main_checkout(base_cwd);
        };

        match self.ensure_worktree(base_cwd, request).await {
            Ok(worktree) => WorktreeSetup::isolated(&worktree),
            Err(e) => {
                warn!(
                    "Worktree setup for branch {} at {:?} failed: {}",
                    request.branch, request.path, e
                );
                WorktreeSetup::failed(base_cwd, e.to_string())
            }
        }
    }

    /// Create the requested worktree, or reuse it when it already exists on
    /// the requested branch
    pub async fn ensure_worktree(&self, repo_path: &Path, request: &WorktreeRequest) -> Result<Worktree> {
        if !is_git_repository(repo_path).await? {
            return Err(WorktreeError::NotAGitRepository {
                path: repo_path.to_path_buf(),
            });
        }
        let branch = request.branch.trim();
        if branch.is_empty() || !is_valid_branch_name(repo_path, branch).await? {
            return Err(WorktreeError::InvalidBranch {
                branch: request.branch.clone(),
            });
        }

        let repo_root = get_repo_root(repo_path).await?;
        let requested = if request.path.is_absolute() {
            request.path.clone()
        } else {
            repo_root.join(&request.path)
        };
        let worktree_path = normalize(&requested).await;
        let worktrees = self.list(&repo_root).await?;

        if let Some(existing) = worktrees.iter().find(|wt| wt.path == worktree_path) {
            if existing.branch == branch {
                info!("Reusing worktree at {:?} on branch {}", worktree_path, branch);
                return Ok(existing.clone());
            }
            return Err(WorktreeError::BranchMismatch {
                path: worktree_path,
                expected: branch.to_string(),
                actual: existing.branch.clone(),
            });
        }

        if let Some(other) = worktrees.iter().find(|wt| wt.branch == branch) {
            return Err(WorktreeError::BranchCheckedOut {
                branch: branch.to_string(),
                path: other.path.clone(),
            });
        }

        if worktree_path.exists() {
            let mut entries = tokio::fs::read_dir(&worktree_path).await?;
            if entries.next_entry().await?.is_some() {
                return Err(WorktreeError::InvalidPath {
                    path: worktree_path,
                });
            }
        } else if let Some(parent) = worktree_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let path = path_arg(&worktree_path)?;
        if branch_exists(&repo_root, branch).await? {
            info!("Creating worktree at {:?} on existing branch {}", worktree_path, branch);
            git_command_checked(&repo_root, &["worktree", "add", path, branch]).await?;
        } else {
            let base = request.base_branch.as_deref().unwrap_or("HEAD");
            info!(
                "Creating worktree at {:?} on new branch {} from {}",
                worktree_path, branch, base
            );
            git_command_checked(&repo_root, &["worktree", "add", "-b", branch, path, base]).await?;
        }

        let head = git_command_checked(&worktree_path, &["rev-parse", "HEAD"]).await?;
        Ok(Worktree {
            path: normalize(&worktree_path).await,
            branch: branch.to_string(),
            head: head.trim().to_string(),
            is_main: false,
        })
    }

    /// List all worktrees of the repository at `repo_path`
    pub async fn list(&self, repo_path: &Path) -> Result<Vec<Worktree>> {
        let output = git_command_checked(repo_path, &["worktree", "list", "--porcelain"]).await?;

        let mut worktrees: Vec<Worktree> = Vec::new();
        for line in output.lines() {
            if let Some(path) = line.strip_prefix("worktree ") {
                worktrees.push(Worktree {
                    path: PathBuf::from(path),
                    branch: String::new(),
                    head: String::new(),
                    is_main: worktrees.is_empty(),
                });
            } else if let Some(wt) = worktrees.last_mut() {
                if let Some(head) = line.strip_prefix("HEAD ") {
                    wt.head = head.to_string();
                } else if let Some(branch) = line.strip_prefix("branch ") {
                    wt.branch = branch.trim_start_matches("refs/heads/").to_string();
                }
            }
        }

        Ok(worktrees)
    }
}
