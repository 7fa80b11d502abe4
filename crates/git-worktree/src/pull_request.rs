//! Pull request creation from a run's worktree

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

use crate::commands::{
    current_branch, gh_command_checked, git_command, git_command_checked, has_remote,
    push_branch, remote_default_branch,
};
use crate::error::{Result, WorktreeError};
use crate::worktree::RunWorktreeManager;

/// What to open the pull request with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestRequest {
    pub title: String,
    pub body: String,
    /// Target branch; the remote's default branch when unset
    #[serde(default)]
    pub base_branch: Option<String>,
    #[serde(default)]
    pub draft: bool,
}

/// Outcome of opening a pull request; never an error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestOutcome {
    pub success: bool,
    pub pr_url: Option<String>,
    pub error: Option<String>,
}

impl PullRequestOutcome {
    fn opened(url: String) -> Self {
        Self {
            success: true,
            pr_url: Some(url),
            error: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            pr_url: None,
            error: Some(error.into()),
        }
    }
}

/// Markdown body listing what the run worked through
pub fn build_pr_body(documents: &[String], tasks_completed: u32) -> String {
    let mut body = String::from("## Auto Run summary\n\n");
    body.push_str(&format!(
        "Completed {} task{} across {} document{}.\n\n",
        tasks_completed,
        if tasks_completed == 1 { "" } else { "s" },
        documents.len(),
        if documents.len() == 1 { "" } else { "s" },
    ));
    if !documents.is_empty() {
        body.push_str("### Documents\n\n");
        for document in documents {
            body.push_str(&format!("- {}\n", document));
        }
    }
    body
}

/// Last line of `gh pr create` output that looks like a URL
fn parse_pr_url(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("https://") || line.starts_with("http://"))
        .last()
        .map(str::to_string)
}

impl RunWorktreeManager {
    /// Commit leftovers, push the worktree's branch and open a pull request
    pub async fn create_pull_request(
        &self,
        worktree_path: &Path,
        request: &PullRequestRequest,
    ) -> PullRequestOutcome {
        match self.try_create_pull_request(worktree_path, request).await {
            Ok(url) => {
                info!("Opened pull request {}", url);
                PullRequestOutcome::opened(url)
            }
            Err(e) => {
                warn!("Failed to open pull request from {:?}: {}", worktree_path, e);
                PullRequestOutcome::failed(e.to_string())
            }
        }
    }

    async fn try_create_pull_request(
        &self,
        worktree_path: &Path,
        request: &PullRequestRequest,
    ) -> Result<String> {
        let branch = current_branch(worktree_path)
            .await?
            .ok_or_else(|| WorktreeError::git_failed("Worktree HEAD is detached"))?;

        if has_uncommitted_changes(worktree_path).await? {
            commit_all(worktree_path, &request.title).await?;
        }

        if !has_remote(worktree_path, &self.remote).await? {
            return Err(WorktreeError::git_failed(format!(
                "Remote '{}' is not configured",
                self.remote
            )));
        }
        push_branch(worktree_path, &self.remote, &branch).await?;

        let base = match &request.base_branch {
            Some(base) => Some(base.clone()),
            None => remote_default_branch(worktree_path, &self.remote).await?,
        };

        let mut args: Vec<&str> = vec![
            "pr",
            "create",
            "--title",
            request.title.as_str(),
            "--body",
            request.body.as_str(),
            "--head",
            branch.as_str(),
        ];
        if let Some(base) = base.as_deref() {
            args.push("--base");
            args.push(base);
        }
        if request.draft {
            args.push("--draft");
        }

        let stdout = gh_command_checked(worktree_path, &args).await?;
        parse_pr_url(&stdout)
            .ok_or_else(|| WorktreeError::gh_failed("gh pr create printed no pull request URL"))
    }
}

/// Check if there are uncommitted changes in a worktree
pub async fn has_uncommitted_changes(worktree_path: &Path) -> Result<bool> {
    let output = git_command(worktree_path, &["status", "--porcelain"]).await?;
    Ok(!output.stdout.trim().is_empty())
}

/// Commit all changes in a worktree, returning the new commit hash
pub async fn commit_all(worktree_path: &Path, message: &str) -> Result<String> {
    git_command_checked(worktree_path, &["add", "-A"]).await?;
    git_command_checked(worktree_path, &["commit", "-m", message]).await?;

    let output = git_command_checked(worktree_path, &["rev-parse", "HEAD"]).await?;
    Ok(output.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worktree::tests::init_test_repo;
    use crate::worktree::WorktreeRequest;

    #[test]
    fn test_pr_body_lists_documents() {
        let body = build_pr_body(&["setup.md".to_string(), "polish.md".to_string()], 4);
        assert!(body.contains("Completed 4 tasks across 2 documents."));
        assert!(body.contains("- setup.md\n- polish.md\n"));

        let body = build_pr_body(&["one.md".to_string()], 1);
        assert!(body.contains("Completed 1 task across 1 document."));
    }

    #[test]
    fn test_parse_pr_url() {
        let stdout = "Creating pull request for autorun/docs into main\n\nhttps://github.com/acme/app/pull/42\n";
        assert_eq!(
            parse_pr_url(stdout).as_deref(),
            Some("https://github.com/acme/app/pull/42")
        );
        assert!(parse_pr_url("nothing useful").is_none());
    }

    #[tokio::test]
    async fn test_pull_request_without_remote_reports_error() {
        let dir = init_test_repo().await;
        let repo = dir.path().join("repo");
        let manager = RunWorktreeManager::new();
        let worktree = manager
            .ensure_worktree(
                &repo,
                &WorktreeRequest {
                    path: dir.path().join("wt"),
                    branch: "autorun/pr".to_string(),
                    base_branch: None,
                    create_pr_on_completion: true,
                    pr_target_branch: None,
                    draft_pr: false,
                },
            )
            .await
            .unwrap();
        tokio::fs::write(worktree.path.join("notes.md"), "- [x] done\n")
            .await
            .unwrap();

        let outcome = manager
            .create_pull_request(
                &worktree.path,
                &PullRequestRequest {
                    title: "Auto Run: docs".to_string(),
                    body: build_pr_body(&["notes.md".to_string()], 1),
                    base_branch: None,
                    draft: true,
                },
            )
            .await;

        assert!(!outcome.success);
        assert!(outcome.pr_url.is_none());
        assert!(outcome.error.unwrap().contains("origin"));
        // Leftover changes were committed before the push was attempted
        assert!(!has_uncommitted_changes(&worktree.path).await.unwrap());
    }
}
