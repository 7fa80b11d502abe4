//! Shared fakes for batch engine tests

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use autorun_core::document::FileDocumentStore;
use autorun_core::history::{HistoryEntry, HistoryKind, HistorySink};
use git_worktree::{PullRequestOutcome, PullRequestRequest, WorktreeRequest, WorktreeSetup};

use super::broadcast::tests::RecordingSink;
use super::orchestrator::Collaborators;
use super::worktree::WorktreeProvider;
use crate::spawner::{AgentSpawner, SpawnRequest, SpawnResult};

/// Prompt template that makes the prompt the document's path
pub(crate) const PATH_PROMPT: &str = "{{DOCUMENT_PATH}}";

/// Agent that checks the first unchecked box of the document named by the prompt
#[derive(Default)]
pub(crate) struct CheckFirstBox {
    calls: AtomicUsize,
}

impl CheckFirstBox {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentSpawner for CheckFirstBox {
    async fn spawn(&self, request: SpawnRequest) -> SpawnResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        check_first_box(Path::new(&request.prompt)).await;
        SpawnResult {
            agent_session_id: Some(format!("agent-{}", self.calls())),
            ..SpawnResult::succeeded("checked one box")
        }
    }
}

pub(crate) async fn check_first_box(path: &Path) {
    let content = tokio::fs::read_to_string(path).await.unwrap();
    tokio::fs::write(path, content.replacen("- [ ]", "- [x]", 1))
        .await
        .unwrap();
}

/// Agent that answers but never touches the document
#[derive(Default)]
pub(crate) struct NeverChanges {
    calls: AtomicUsize,
}

impl NeverChanges {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentSpawner for NeverChanges {
    async fn spawn(&self, _request: SpawnRequest) -> SpawnResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        SpawnResult::succeeded("nothing to do")
    }
}

/// Always works in the main checkout
pub(crate) struct MainCheckout;

#[async_trait]
impl WorktreeProvider for MainCheckout {
    async fn setup(&self, base_cwd: &Path, _request: Option<&WorktreeRequest>) -> WorktreeSetup {
        WorktreeSetup::main_checkout(base_cwd)
    }

    async fn create_pull_request(&self, _path: &Path, _request: &PullRequestRequest) -> PullRequestOutcome {
        PullRequestOutcome {
            success: false,
            pr_url: None,
            error: Some("not a worktree".to_string()),
        }
    }
}

/// Reports every worktree as active and records pull requests
#[derive(Default)]
pub(crate) struct FakeWorktrees {
    pub fail_setup: bool,
    pub pull_requests: Mutex<Vec<PullRequestRequest>>,
}

#[async_trait]
impl WorktreeProvider for FakeWorktrees {
    async fn setup(&self, base_cwd: &Path, request: Option<&WorktreeRequest>) -> WorktreeSetup {
        match request {
            _ if self.fail_setup => WorktreeSetup::failed(base_cwd, "branch is checked out elsewhere"),
            Some(request) => WorktreeSetup {
                success: true,
                effective_cwd: base_cwd.to_path_buf(),
                active: true,
                path: Some(request.path.clone()),
                branch: Some(request.branch.clone()),
                error: None,
            },
            None => WorktreeSetup::main_checkout(base_cwd),
        }
    }

    async fn create_pull_request(&self, _path: &Path, request: &PullRequestRequest) -> PullRequestOutcome {
        self.pull_requests.lock().unwrap().push(request.clone());
        PullRequestOutcome {
            success: true,
            pr_url: Some("https://github.com/acme/app/pull/7".to_string()),
            error: None,
        }
    }
}

#[derive(Default)]
pub(crate) struct RecordingHistory {
    entries: Mutex<Vec<HistoryEntry>>,
}

impl RecordingHistory {
    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.entries.lock().unwrap().clone()
    }

    pub fn count(&self, kind: HistoryKind) -> usize {
        self.entries().iter().filter(|e| e.kind == kind).count()
    }
}

#[async_trait]
impl HistorySink for RecordingHistory {
    async fn add_entry(&self, entry: HistoryEntry) -> autorun_core::Result<()> {
        self.entries.lock().unwrap().push(entry);
        Ok(())
    }
}

pub(crate) struct Fixture {
    pub history: Arc<RecordingHistory>,
    pub broadcast: Arc<RecordingSink>,
    pub collaborators: Collaborators,
}

pub(crate) fn fixture(spawner: Arc<dyn AgentSpawner>, worktrees: Arc<dyn WorktreeProvider>) -> Fixture {
    let history = Arc::new(RecordingHistory::default());
    let broadcast = Arc::new(RecordingSink::default());
    Fixture {
        history: history.clone(),
        broadcast: broadcast.clone(),
        collaborators: Collaborators {
            documents: Arc::new(FileDocumentStore::new()),
            spawner,
            worktrees,
            history,
            broadcast,
        },
    }
}

pub(crate) async fn write_doc(folder: &Path, name: &str, content: &str) {
    tokio::fs::write(folder.join(name), content).await.unwrap();
}

pub(crate) async fn read_doc(folder: &Path, name: &str) -> String {
    tokio::fs::read_to_string(folder.join(name)).await.unwrap()
}

pub(crate) async fn backup_count(folder: &Path) -> usize {
    let mut count = 0;
    let mut entries = tokio::fs::read_dir(folder).await.unwrap();
    while let Some(entry) = entries.next_entry().await.unwrap() {
        if entry.file_name().to_string_lossy().ends_with(".backup.md") {
            count += 1;
        }
    }
    count
}
