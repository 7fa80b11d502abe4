//! Git and GitHub CLI execution utilities

use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::error::{Result, WorktreeError};

/// Output from a git or gh command
#[derive(Debug)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

async fn run(program: &str, cwd: &Path, args: &[&str]) -> std::io::Result<CommandOutput> {
    debug!("Running {} {:?} in {:?}", program, args, cwd);

    let output = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    trace!("{} stdout: {}", program, stdout);
    if !stderr.is_empty() {
        trace!("{} stderr: {}", program, stderr);
    }

    Ok(CommandOutput {
        stdout,
        stderr,
        success: output.status.success(),
    })
}

/// Execute a git command in the specified directory
pub async fn git_command(repo_path: &Path, args: &[&str]) -> Result<CommandOutput> {
    run("git", repo_path, args)
        .await
        .map_err(|e| WorktreeError::git_failed_with_source("Failed to execute git command", e))
}

/// Execute a git command and return error if it fails
pub async fn git_command_checked(repo_path: &Path, args: &[&str]) -> Result<String> {
    let output = git_command(repo_path, args).await?;

    if !output.success {
        return Err(WorktreeError::git_failed(format!(
            "git {} failed: {}",
            args.join(" "),
            output.stderr.trim()
        )));
    }

    Ok(output.stdout)
}

/// Execute a GitHub CLI command and return its stdout
pub async fn gh_command_checked(cwd: &Path, args: &[&str]) -> Result<String> {
    let output = run("gh", cwd, args)
        .await
        .map_err(|e| WorktreeError::gh_failed_with_source("Failed to execute gh", e))?;

    if !output.success {
        return Err(WorktreeError::gh_failed(format!(
            "gh {} failed: {}",
            args.first().copied().unwrap_or_default(),
            output.stderr.trim()
        )));
    }

    Ok(output.stdout)
}

/// Check if a path is inside a git repository
pub async fn is_git_repository(path: &Path) -> Result<bool> {
    if !path.is_dir() {
        return Ok(false);
    }
    let output = git_command(path, &["rev-parse", "--git-dir"]).await?;
    Ok(output.success)
}

/// Get the root directory of the git repository
pub async fn get_repo_root(path: &Path) -> Result<PathBuf> {
    let output = git_command_checked(path, &["rev-parse", "--show-toplevel"]).await?;
    Ok(PathBuf::from(output.trim()))
}

/// Check if a branch exists
pub async fn branch_exists(repo_path: &Path, branch: &str) -> Result<bool> {
    let output = git_command(
        repo_path,
        &["rev-parse", "--verify", &format!("refs/heads/{}", branch)],
    )
    .await?;
    Ok(output.success)
}

/// Check whether a name is acceptable as a branch name
pub async fn is_valid_branch_name(repo_path: &Path, branch: &str) -> Result<bool> {
    let output = git_command(repo_path, &["check-ref-format", "--branch", branch]).await?;
    Ok(output.success)
}

/// Branch checked out in `path`, `None` when HEAD is detached
pub async fn current_branch(path: &Path) -> Result<Option<String>> {
    let output = git_command(path, &["symbolic-ref", "--quiet", "--short", "HEAD"]).await?;
    if !output.success {
        return Ok(None);
    }
    let branch = output.stdout.trim();
    Ok((!branch.is_empty()).then(|| branch.to_string()))
}

/// Check if a remote is configured
pub async fn has_remote(repo_path: &Path, remote: &str) -> Result<bool> {
    let output = git_command(repo_path, &["remote", "get-url", remote]).await?;
    Ok(output.success)
}

/// Push a branch and set its upstream
pub async fn push_branch(repo_path: &Path, remote: &str, branch: &str) -> Result<()> {
    git_command_checked(repo_path, &["push", "--set-upstream", remote, branch]).await?;
    Ok(())
}

/// Default branch of `remote`, as recorded by the last clone or fetch
pub async fn remote_default_branch(repo_path: &Path, remote: &str) -> Result<Option<String>> {
    let output = git_command(
        repo_path,
        &[
            "symbolic-ref",
            "--quiet",
            "--short",
            &format!("refs/remotes/{}/HEAD", remote),
        ],
    )
    .await?;
    if !output.success {
        return Ok(None);
    }
    let prefix = format!("{}/", remote);
    Ok(output
        .stdout
        .trim()
        .strip_prefix(&prefix)
        .map(str::to_string))
}
