//! The batch run loop
//!
//! A run works through its documents in order, one agent call per task,
//! until every document is done, stalls or is skipped. In loop mode the whole
//! pass repeats until a loop exit condition holds. Finalization runs exactly
//! once on every exit path and always leaves the documents without backups.

use std::path::PathBuf;
use std::sync::Arc;

use autorun_core::batch::{
    BatchRunError, DocumentEntry, ErrorResolution, ProcessingState, ProgressUpdate,
    StartBatchParams, UsageStats, WorktreeInfo,
};
use autorun_core::document::{count_tasks, uncheck_all, DocumentRepository};
use autorun_core::history::{Achievements, BatchStatus, HistoryEntry, HistorySink};
use git_worktree::{build_pr_body, PullRequestRequest, WorktreeRequest, WorktreeSetup};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::broadcast::BroadcastSink;
use super::config::OrchestratorConfig;
use super::context::RunContext;
use super::processor::{DocumentProcessor, TaskInput, TaskRun};
use super::worktree::WorktreeProvider;
use crate::error::{ExecutorError, Result};
use crate::spawner::AgentSpawner;

/// External collaborators of the batch engine
#[derive(Clone)]
pub struct Collaborators {
    pub documents: Arc<dyn DocumentRepository>,
    pub spawner: Arc<dyn AgentSpawner>,
    pub worktrees: Arc<dyn WorktreeProvider>,
    pub history: Arc<dyn HistorySink>,
    pub broadcast: Arc<dyn BroadcastSink>,
}

/// Request to run a set of documents for one session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    pub session_id: String,
    #[serde(default)]
    pub session_name: String,
    /// Folder holding the documents
    pub folder_path: PathBuf,
    /// Main checkout the agent works in unless a worktree is used
    pub cwd: PathBuf,
    pub documents: Vec<DocumentEntry>,
    /// Prompt template; the default prompt when empty
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub loop_enabled: bool,
    #[serde(default)]
    pub max_loops: Option<u32>,
    #[serde(default)]
    pub worktree: Option<WorktreeRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StalledDocument {
    pub filename: String,
    pub reason: String,
}

/// What a finished run did
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    pub status: BatchStatus,
    pub tasks_completed: u32,
    /// Passes over the document list that ran to the end
    pub loops_completed: u32,
    pub stalled_documents: Vec<StalledDocument>,
    pub elapsed_ms: u64,
    pub cumulative_task_time_ms: u64,
    pub usage: UsageStats,
    pub pr_url: Option<String>,
    /// Nothing to do; no run was created
    pub noop: bool,
}

impl BatchOutcome {
    fn noop() -> Self {
        Self {
            status: BatchStatus::Completed,
            tasks_completed: 0,
            loops_completed: 0,
            stalled_documents: Vec::new(),
            elapsed_ms: 0,
            cumulative_task_time_ms: 0,
            usage: UsageStats::default(),
            pr_url: None,
            noop: true,
        }
    }
}

/// How the work on one document ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DocumentEnd {
    Finished,
    Stalled,
    Skipped,
    Stopped,
}

/// Operator decision taken between documents
#[derive(Debug, Clone, Copy)]
struct Settled {
    resolution: ErrorResolution,
    /// Document the error was raised on
    document_index: Option<usize>,
}

/// Running totals of one run
#[derive(Debug, Default)]
struct Tally {
    tasks_completed: u32,
    total_tasks: u32,
    passes: u32,
    usage: UsageStats,
    stalled: Vec<StalledDocument>,
    documents_processed: Vec<String>,
    stopped: bool,
    /// Loop mode gave up after a pass without progress
    global_stall: bool,
    /// Reset document holding a backup right now
    mid_reset: Option<String>,
    /// Documents this run has backed up; the only backups it may delete
    backups: Vec<String>,
}

impl Tally {
    fn mark_processed(&mut self, filename: &str) {
        if !self.documents_processed.iter().any(|d| d == filename) {
            self.documents_processed.push(filename.to_string());
        }
    }

    fn status(&self) -> BatchStatus {
        if self.stopped {
            BatchStatus::Stopped
        } else if self.global_stall {
            BatchStatus::Stalled
        } else if !self.stalled.is_empty() {
            BatchStatus::CompletedWithStalls
        } else {
            BatchStatus::Completed
        }
    }
}

/// Where the agent works for this run
struct Workspace {
    cwd: PathBuf,
    setup: WorktreeSetup,
}

pub struct BatchOrchestrator {
    config: OrchestratorConfig,
    processor: DocumentProcessor,
    documents: Arc<dyn DocumentRepository>,
    worktrees: Arc<dyn WorktreeProvider>,
    history: Arc<dyn HistorySink>,
}

impl BatchOrchestrator {
    pub fn new(config: OrchestratorConfig, collaborators: &Collaborators) -> Self {
        Self {
            config,
            processor: DocumentProcessor::new(
                Arc::clone(&collaborators.documents),
                Arc::clone(&collaborators.spawner),
            ),
            documents: Arc::clone(&collaborators.documents),
            worktrees: Arc::clone(&collaborators.worktrees),
            history: Arc::clone(&collaborators.history),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run a batch to completion
    ///
    /// Returns a no-op outcome without creating a run when the documents
    /// hold no unchecked task. Worktree setup failures are returned as
    /// [`ExecutorError::SetupFailed`] after the run record was dropped.
    pub async fn run(&self, ctx: &RunContext, request: BatchRequest) -> Result<BatchOutcome> {
        if request.documents.is_empty() {
            return Err(ExecutorError::invalid_request("No documents to process"));
        }

        let mut initial_total = 0;
        for entry in &request.documents {
            initial_total += self
                .processor
                .count(&request.folder_path, &entry.filename)
                .await?
                .unchecked;
        }
        if initial_total == 0 {
            info!(session_id = %request.session_id, "No unchecked tasks, nothing to run");
            return Ok(BatchOutcome::noop());
        }

        let store = ctx.store();
        let session_id = ctx.session_id();
        let _ = store
            .start_batch(
                session_id,
                StartBatchParams {
                    session_name: request.session_name.clone(),
                    folder_path: request.folder_path.clone(),
                    documents: request.documents.clone(),
                    total_tasks: initial_total,
                    loop_enabled: request.loop_enabled,
                    max_loops: request.max_loops,
                },
            )
            .await?;
        ctx.tracker().start();

        let workspace = match self.prepare_workspace(ctx, &request).await {
            Ok(workspace) => workspace,
            Err(e) => {
                ctx.tracker().stop();
                return Err(e);
            }
        };
        info!(
            session_id,
            documents = request.documents.len(),
            tasks = initial_total,
            cwd = %workspace.cwd.display(),
            "Batch run started"
        );

        let mut tally = Tally {
            total_tasks: initial_total,
            ..Tally::default()
        };
        let result = self.run_passes(ctx, &request, &workspace, &mut tally).await;
        if let Err(e) = &result {
            error!(session_id, "Batch run failed: {}", e);
            tally.stopped = true;
        }

        let outcome = self
            .finalize(ctx, &request, &workspace, tally, result.as_ref().err())
            .await;
        result.map(|()| outcome)
    }

    async fn prepare_workspace(&self, ctx: &RunContext, request: &BatchRequest) -> Result<Workspace> {
        let setup = self
            .worktrees
            .setup(&request.cwd, request.worktree.as_ref())
            .await;

        if !setup.success {
            let reason = setup
                .error
                .clone()
                .unwrap_or_else(|| "Worktree setup failed".to_string());
            warn!(session_id = %ctx.session_id(), "Batch setup failed: {}", reason);
            let _ = ctx
                .store()
                .set_initialization_failed(ctx.session_id(), &reason)
                .await;
            return Err(ExecutorError::SetupFailed { message: reason });
        }

        let worktree = setup.active.then(|| WorktreeInfo {
            active: true,
            path: setup.path.clone().unwrap_or_else(|| setup.effective_cwd.clone()),
            branch: setup.branch.clone().unwrap_or_default(),
        });
        let _ = ctx.store().set_running(ctx.session_id(), worktree).await;

        Ok(Workspace {
            cwd: setup.effective_cwd.clone(),
            setup,
        })
    }

    async fn run_passes(
        &self,
        ctx: &RunContext,
        request: &BatchRequest,
        workspace: &Workspace,
        tally: &mut Tally,
    ) -> Result<()> {
        let session_id = ctx.session_id();
        let mut loop_iteration = 0u32;

        loop {
            if ctx.is_stop_requested() {
                info!(session_id, "Batch run stopped by user");
                tally.stopped = true;
                return Ok(());
            }

            let completed_at_start = tally.tasks_completed;
            for (index, entry) in request.documents.iter().enumerate() {
                if ctx.is_stop_requested() {
                    tally.stopped = true;
                    break;
                }
                match self.settle_pause(ctx).await {
                    Some(Settled {
                        resolution: ErrorResolution::Abort,
                        ..
                    }) => {
                        tally.stopped = true;
                        break;
                    }
                    Some(Settled {
                        resolution: ErrorResolution::SkipDocument,
                        document_index,
                    }) if document_index.map_or(true, |errored| errored >= index) => {
                        info!(session_id, document = %entry.filename, "Skipping document");
                        continue;
                    }
                    _ => {}
                }

                let end = self
                    .process_document(ctx, request, workspace, tally, index, entry, loop_iteration)
                    .await?;
                if end == DocumentEnd::Stopped {
                    tally.stopped = true;
                    break;
                }
            }

            if !tally.stopped {
                let settled = self.settle_pause(ctx).await;
                if matches!(settled, Some(Settled { resolution: ErrorResolution::Abort, .. })) {
                    tally.stopped = true;
                }
            }
            if tally.stopped {
                info!(session_id, "Batch run stopped by user");
                return Ok(());
            }

            tally.passes += 1;
            let pass_completed = tally.tasks_completed - completed_at_start;
            if !request.loop_enabled {
                return Ok(());
            }

            if request.max_loops.is_some_and(|max| tally.passes >= max) {
                info!(session_id, passes = tally.passes, "Reached the maximum number of loops");
                return Ok(());
            }
            if pass_completed == 0 {
                warn!(session_id, "No task completed in a whole pass, ending the loop");
                tally.global_stall = true;
                return Ok(());
            }

            let mut remaining = 0;
            let mut non_reset_remaining = None;
            for entry in &request.documents {
                let unchecked = self
                    .processor
                    .count(&request.folder_path, &entry.filename)
                    .await?
                    .unchecked;
                remaining += unchecked;
                if !entry.reset_on_completion {
                    *non_reset_remaining.get_or_insert(0) += unchecked;
                }
            }
            if non_reset_remaining == Some(0) {
                info!(session_id, "All documents are done, ending the loop");
                return Ok(());
            }

            self.record(
                HistoryEntry::loop_summary(session_id, loop_iteration, pass_completed)
                    .with_usage(Some(tally.usage)),
            )
            .await;

            tally.total_tasks = tally.tasks_completed + remaining;
            let _ = ctx.store().increment_loop(session_id, tally.total_tasks).await;
            loop_iteration += 1;
            debug!(session_id, loop_iteration, remaining, "Starting next loop");
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_document(
        &self,
        ctx: &RunContext,
        request: &BatchRequest,
        workspace: &Workspace,
        tally: &mut Tally,
        index: usize,
        entry: &DocumentEntry,
        loop_iteration: u32,
    ) -> Result<DocumentEnd> {
        let session_id = ctx.session_id();
        let folder = request.folder_path.as_path();
        let filename = entry.filename.as_str();

        let content = self.documents.read(folder, filename).await?;
        let mut counts = count_tasks(&content);
        if counts.unchecked == 0 {
            if !(entry.reset_on_completion && request.loop_enabled && counts.checked > 0) {
                return Ok(DocumentEnd::Finished);
            }
            let reset = uncheck_all(&content);
            self.documents.write(folder, filename, &reset).await?;
            counts = count_tasks(&reset);
            tally.total_tasks += counts.unchecked;
            debug!(session_id, document = filename, "Reset completed document for this pass");
        }

        let mut doc_total = counts.unchecked;
        let mut doc_completed = 0u32;
        let _ = ctx
            .store()
            .update_progress(
                session_id,
                ProgressUpdate {
                    current_document_index: Some(index),
                    current_doc_tasks_total: Some(doc_total),
                    current_doc_tasks_completed: Some(0),
                    total_tasks_across_all_docs: Some(tally.total_tasks),
                    ..Default::default()
                },
            )
            .await;
        tally.mark_processed(filename);

        if entry.reset_on_completion {
            self.documents.create_backup(folder, filename).await?;
            if !tally.backups.iter().any(|b| b == filename) {
                tally.backups.push(filename.to_string());
            }
            tally.mid_reset = Some(filename.to_string());
        }

        let mut remaining = counts.unchecked;
        let mut no_change = 0u32;
        let mut end = DocumentEnd::Finished;

        while remaining > 0 {
            if ctx.is_stop_requested() {
                end = DocumentEnd::Stopped;
                break;
            }
            match ctx.wait_if_paused().await {
                Some(ErrorResolution::Abort) => {
                    end = DocumentEnd::Stopped;
                    break;
                }
                Some(ErrorResolution::SkipDocument) => {
                    info!(session_id, document = filename, "Skipping document");
                    end = DocumentEnd::Skipped;
                    break;
                }
                Some(ErrorResolution::Resume) => continue,
                None => {}
            }

            let run = self
                .processor
                .process_task(TaskInput {
                    session_id,
                    session_name: &request.session_name,
                    folder,
                    filename,
                    prompt_template: &request.prompt,
                    cwd: &workspace.cwd,
                    loop_iteration,
                    git_branch: workspace.setup.branch.as_deref(),
                })
                .await?;

            ctx.tracker().record_task(run.elapsed);
            if let Some(agent_session_id) = &run.agent_session_id {
                ctx.store()
                    .record_agent_session(session_id, agent_session_id)
                    .await;
            }
            if let Some(usage) = run.usage {
                tally.usage += usage;
            }
            doc_completed += run.completed;
            doc_total += run.added;
            tally.tasks_completed += run.completed;
            tally.total_tasks += run.added;
            remaining = run.counts_after.unchecked;

            self.record(task_entry(session_id, filename, loop_iteration, &run))
                .await;
            let _ = ctx
                .store()
                .update_progress(
                    session_id,
                    ProgressUpdate {
                        current_doc_tasks_total: Some(doc_total),
                        current_doc_tasks_completed: Some(doc_completed),
                        total_tasks_across_all_docs: Some(tally.total_tasks),
                        completed_tasks_across_all_docs: Some(tally.tasks_completed),
                        timing: Some(ctx.tracker().timing()),
                        ..Default::default()
                    },
                )
                .await;

            if let Some(agent_error) = run.error.clone() {
                if self.config.pause_on_agent_error {
                    let paused = ctx
                        .pause_on_error(BatchRunError {
                            error: agent_error,
                            document_index: index,
                            task_description: run.task_description.clone(),
                        })
                        .await;
                    match paused {
                        Ok(()) => continue,
                        Err(e) => debug!(session_id, "Not pausing on agent error: {}", e),
                    }
                }
            }

            if run.made_no_change() {
                no_change += 1;
                if no_change >= self.config.stall_threshold {
                    let reason = format!(
                        "No changes after {} consecutive attempts{}",
                        no_change,
                        run.task_description
                            .as_deref()
                            .map(|task| format!(" on \"{task}\""))
                            .unwrap_or_default()
                    );
                    warn!(session_id, document = filename, "Document stalled: {}", reason);
                    self.record(HistoryEntry::stall(session_id, filename, reason.clone()))
                        .await;
                    tally.stalled.push(StalledDocument {
                        filename: filename.to_string(),
                        reason,
                    });
                    end = DocumentEnd::Stalled;
                    break;
                }
            } else {
                no_change = 0;
            }
        }

        if !entry.reset_on_completion {
            return Ok(end);
        }

        match end {
            DocumentEnd::Stopped => {
                // finalization restores it
            }
            DocumentEnd::Stalled | DocumentEnd::Skipped => {
                self.documents.restore_backup(folder, filename).await?;
                self.documents.delete_backup(folder, filename).await?;
                tally.mid_reset = None;
            }
            DocumentEnd::Finished => {
                if doc_completed > 0 {
                    self.documents.restore_backup(folder, filename).await?;
                    if request.loop_enabled {
                        tally.total_tasks += self.processor.count(folder, filename).await?.unchecked;
                    }
                }
                self.documents.delete_backup(folder, filename).await?;
                tally.mid_reset = None;
            }
        }
        Ok(end)
    }

    /// Wait out an error raised outside of a document's task loop
    async fn settle_pause(&self, ctx: &RunContext) -> Option<Settled> {
        let document_index = ctx.pending_error_document().await;
        let resolution = ctx.wait_if_paused().await?;
        Some(Settled {
            resolution,
            document_index,
        })
    }

    async fn finalize(
        &self,
        ctx: &RunContext,
        request: &BatchRequest,
        workspace: &Workspace,
        mut tally: Tally,
        failure: Option<&ExecutorError>,
    ) -> BatchOutcome {
        let session_id = ctx.session_id();
        let folder = request.folder_path.as_path();

        if let Some(filename) = tally.mid_reset.take() {
            if let Err(e) = self.documents.restore_backup(folder, &filename).await {
                warn!(session_id, document = %filename, "Failed to restore document: {}", e);
            }
        }
        match self.documents.delete_backups(folder, &tally.backups).await {
            Ok(0) => {}
            Ok(removed) => debug!(session_id, removed, "Removed document backups"),
            Err(e) => warn!(session_id, "Failed to remove document backups: {}", e),
        }

        let elapsed = ctx.tracker().stop();
        let timing = ctx.tracker().timing();
        ctx.store().update_timing(session_id, timing).await;

        let status = tally.status();
        let pr_url = self.open_pull_request(session_id, request, workspace, &tally).await;

        let achievements = Achievements::compute(
            tally.documents_processed.len() as u32,
            tally.tasks_completed,
            tally.passes,
            tally.stalled.iter().map(|s| s.filename.clone()).collect(),
            elapsed.as_millis() as u64,
            timing.cumulative_task_time_ms,
        );
        let mut summary = HistoryEntry::batch_summary(session_id, status, achievements)
            .with_elapsed_ms(elapsed.as_millis() as u64)
            .with_usage(Some(tally.usage));
        if let Some(e) = failure {
            summary = summary.with_details(e.to_string()).with_success(false);
        }
        self.record(summary).await;

        match ctx.store().state(session_id).await {
            ProcessingState::PausedError => {
                let _ = ctx.store().abort(session_id).await;
            }
            ProcessingState::Running if tally.stopped => {
                let _ = ctx.store().set_stopping(session_id).await;
            }
            _ => {}
        }
        let _ = ctx.store().complete_batch(session_id).await;

        info!(
            session_id,
            %status,
            tasks = tally.tasks_completed,
            passes = tally.passes,
            elapsed_ms = elapsed.as_millis() as u64,
            "Batch run finished"
        );

        BatchOutcome {
            status,
            tasks_completed: tally.tasks_completed,
            loops_completed: tally.passes,
            stalled_documents: tally.stalled,
            elapsed_ms: elapsed.as_millis() as u64,
            cumulative_task_time_ms: timing.cumulative_task_time_ms,
            usage: tally.usage,
            pr_url,
            noop: false,
        }
    }

    async fn open_pull_request(
        &self,
        session_id: &str,
        request: &BatchRequest,
        workspace: &Workspace,
        tally: &Tally,
    ) -> Option<String> {
        let worktree = request.worktree.as_ref()?;
        if !workspace.setup.active
            || !worktree.create_pr_on_completion
            || tally.stopped
            || tally.tasks_completed == 0
        {
            return None;
        }

        let path = workspace
            .setup
            .path
            .clone()
            .unwrap_or_else(|| workspace.cwd.clone());
        let title = if request.session_name.is_empty() {
            format!("Auto Run: {}", worktree.branch)
        } else {
            format!("Auto Run: {}", request.session_name)
        };
        let outcome = self
            .worktrees
            .create_pull_request(
                &path,
                &PullRequestRequest {
                    title,
                    body: build_pr_body(&tally.documents_processed, tally.tasks_completed),
                    base_branch: worktree.pr_target_branch.clone(),
                    draft: worktree.draft_pr,
                },
            )
            .await;

        self.record(HistoryEntry::pull_request(
            session_id,
            outcome.pr_url.clone(),
            outcome.error.clone(),
        ))
        .await;
        outcome.pr_url
    }

    async fn record(&self, entry: HistoryEntry) {
        if let Err(e) = self.history.add_entry(entry).await {
            warn!("Failed to write history entry: {}", e);
        }
    }
}

fn task_entry(session_id: &str, filename: &str, loop_iteration: u32, run: &TaskRun) -> HistoryEntry {
    let task = run.task_description.as_deref().unwrap_or("next task");
    let summary = match (&run.error, run.completed) {
        (Some(error), _) => format!("Agent failed on: {task} ({})", error.message),
        (None, 0) => format!("No progress on: {task}"),
        (None, _) => format!("Completed: {task}"),
    };
    let mut entry = HistoryEntry::task(session_id, filename, summary)
        .with_success(run.error.is_none() && run.completed > 0)
        .with_agent_session(run.agent_session_id.clone())
        .with_loop_iteration(loop_iteration)
        .with_elapsed_ms(run.elapsed.as_millis() as u64)
        .with_usage(run.usage);
    if let Some(response) = run.response.as_deref().filter(|r| !r.trim().is_empty()) {
        entry = entry.with_details(response);
    }
    entry
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::test_support::{
        backup_count, check_first_box, fixture, read_doc, write_doc, CheckFirstBox, FakeWorktrees,
        MainCheckout, NeverChanges, PATH_PROMPT,
    };
    use crate::spawner::{SpawnRequest, SpawnResult};
    use async_trait::async_trait;
    use autorun_core::batch::BatchStateStore;
    use autorun_core::history::HistoryKind;
    use std::path::Path;
    use tempfile::TempDir;

    fn request(folder: &Path, documents: Vec<DocumentEntry>) -> BatchRequest {
        BatchRequest {
            session_id: "s1".to_string(),
            session_name: "agent".to_string(),
            folder_path: folder.to_path_buf(),
            cwd: folder.to_path_buf(),
            documents,
            prompt: PATH_PROMPT.to_string(),
            loop_enabled: false,
            max_loops: None,
            worktree: None,
        }
    }

    fn context() -> (Arc<BatchStateStore>, RunContext) {
        let store = Arc::new(BatchStateStore::new());
        let ctx = RunContext::new("s1", Arc::clone(&store));
        (store, ctx)
    }

    #[tokio::test]
    async fn test_documents_without_loop() {
        let dir = TempDir::new().unwrap();
        write_doc(dir.path(), "setup.md", "# Setup\n- [ ] a\n- [ ] b\n- [ ] c\n").await;
        write_doc(dir.path(), "polish.md", "- [ ] polish\n").await;

        let spawner = Arc::new(CheckFirstBox::default());
        let fx = fixture(spawner.clone(), Arc::new(MainCheckout));
        let orchestrator = BatchOrchestrator::new(OrchestratorConfig::default(), &fx.collaborators);
        let (store, ctx) = context();

        let outcome = orchestrator
            .run(
                &ctx,
                request(
                    dir.path(),
                    vec![
                        DocumentEntry::new("setup.md"),
                        DocumentEntry::new("polish.md").with_reset_on_completion(),
                    ],
                ),
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, BatchStatus::Completed);
        assert_eq!(outcome.tasks_completed, 4);
        assert_eq!(outcome.loops_completed, 1);
        assert!(!outcome.noop);
        assert_eq!(spawner.calls(), 4);

        assert!(store.get("s1").await.is_none());
        assert_eq!(store.state("s1").await, ProcessingState::Idle);
        assert_eq!(backup_count(dir.path()).await, 0);
        assert_eq!(read_doc(dir.path(), "setup.md").await, "# Setup\n- [x] a\n- [x] b\n- [x] c\n");
        assert_eq!(read_doc(dir.path(), "polish.md").await, "- [ ] polish\n");

        assert_eq!(fx.history.count(HistoryKind::Task), 4);
        assert_eq!(fx.history.count(HistoryKind::BatchSummary), 1);
        assert_eq!(fx.history.count(HistoryKind::LoopSummary), 0);
    }

    #[tokio::test]
    async fn test_unchanging_agent_stalls_document() {
        let dir = TempDir::new().unwrap();
        write_doc(dir.path(), "stuck.md", "- [ ] impossible\n").await;

        let spawner = Arc::new(NeverChanges::default());
        let fx = fixture(spawner.clone(), Arc::new(MainCheckout));
        let orchestrator = BatchOrchestrator::new(OrchestratorConfig::default(), &fx.collaborators);
        let (store, ctx) = context();

        let outcome = orchestrator
            .run(&ctx, request(dir.path(), vec![DocumentEntry::new("stuck.md")]))
            .await
            .unwrap();

        assert_eq!(spawner.calls(), 2);
        assert_eq!(outcome.status, BatchStatus::CompletedWithStalls);
        assert_eq!(outcome.tasks_completed, 0);
        assert_eq!(outcome.stalled_documents.len(), 1);
        assert_eq!(outcome.stalled_documents[0].filename, "stuck.md");
        assert!(outcome.stalled_documents[0].reason.contains("impossible"));
        assert_eq!(fx.history.count(HistoryKind::Stall), 1);
        assert!(store.get("s1").await.is_none());
    }

    #[tokio::test]
    async fn test_stall_moves_on_to_next_document() {
        let dir = TempDir::new().unwrap();
        write_doc(dir.path(), "stuck.md", "- [ ] impossible\n").await;
        write_doc(dir.path(), "next.md", "- [ ] easy\n").await;

        /// Refuses to touch stuck.md
        struct Picky;

        #[async_trait]
        impl AgentSpawner for Picky {
            async fn spawn(&self, request: SpawnRequest) -> SpawnResult {
                if !request.prompt.ends_with("stuck.md") {
                    check_first_box(Path::new(&request.prompt)).await;
                }
                SpawnResult::succeeded("ok")
            }
        }

        let fx = fixture(Arc::new(Picky), Arc::new(MainCheckout));
        let orchestrator = BatchOrchestrator::new(OrchestratorConfig::default(), &fx.collaborators);
        let (_store, ctx) = context();

        let outcome = orchestrator
            .run(
                &ctx,
                request(
                    dir.path(),
                    vec![DocumentEntry::new("stuck.md"), DocumentEntry::new("next.md")],
                ),
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, BatchStatus::CompletedWithStalls);
        assert_eq!(outcome.tasks_completed, 1);
        assert_eq!(read_doc(dir.path(), "next.md").await, "- [x] easy\n");
    }

    #[tokio::test]
    async fn test_no_tasks_is_noop() {
        let dir = TempDir::new().unwrap();
        write_doc(dir.path(), "done.md", "- [x] done\n").await;

        let spawner = Arc::new(CheckFirstBox::default());
        let fx = fixture(spawner.clone(), Arc::new(MainCheckout));
        let orchestrator = BatchOrchestrator::new(OrchestratorConfig::default(), &fx.collaborators);
        let (store, ctx) = context();

        let outcome = orchestrator
            .run(&ctx, request(dir.path(), vec![DocumentEntry::new("done.md")]))
            .await
            .unwrap();

        assert!(outcome.noop);
        assert_eq!(spawner.calls(), 0);
        assert!(store.get("s1").await.is_none());
        assert!(fx.history.entries().is_empty());
    }

    #[tokio::test]
    async fn test_stop_mid_reset_document_restores_content() {
        let dir = TempDir::new().unwrap();
        let original = "# Polish\n- [ ] one\n- [ ] two\n";
        write_doc(dir.path(), "polish.md", original).await;

        /// Checks one box, then asks the run to stop
        struct StopAfterFirstCall {
            ctx: Arc<RunContext>,
        }

        #[async_trait]
        impl AgentSpawner for StopAfterFirstCall {
            async fn spawn(&self, request: SpawnRequest) -> SpawnResult {
                check_first_box(Path::new(&request.prompt)).await;
                self.ctx.request_stop().await;
                SpawnResult::succeeded("ok")
            }
        }

        let store = Arc::new(BatchStateStore::new());
        let ctx = Arc::new(RunContext::new("s1", Arc::clone(&store)));
        let spawner = Arc::new(StopAfterFirstCall { ctx: Arc::clone(&ctx) });
        let fx = fixture(spawner, Arc::new(MainCheckout));
        let orchestrator = BatchOrchestrator::new(OrchestratorConfig::default(), &fx.collaborators);

        let mut req = request(
            dir.path(),
            vec![DocumentEntry::new("polish.md").with_reset_on_completion()],
        );
        req.loop_enabled = true;
        let outcome = orchestrator.run(&ctx, req).await.unwrap();

        assert_eq!(outcome.status, BatchStatus::Stopped);
        assert_eq!(outcome.tasks_completed, 1);
        assert_eq!(read_doc(dir.path(), "polish.md").await, original);
        assert_eq!(backup_count(dir.path()).await, 0);
        assert!(store.get("s1").await.is_none());
    }

    #[tokio::test]
    async fn test_loop_ends_when_regular_documents_are_done() {
        let dir = TempDir::new().unwrap();
        write_doc(dir.path(), "setup.md", "- [ ] a\n- [ ] b\n").await;
        write_doc(dir.path(), "polish.md", "- [ ] polish\n").await;

        let spawner = Arc::new(CheckFirstBox::default());
        let fx = fixture(spawner.clone(), Arc::new(MainCheckout));
        let orchestrator = BatchOrchestrator::new(OrchestratorConfig::default(), &fx.collaborators);
        let (_store, ctx) = context();

        let mut req = request(
            dir.path(),
            vec![
                DocumentEntry::new("setup.md"),
                DocumentEntry::new("polish.md").with_reset_on_completion(),
            ],
        );
        req.loop_enabled = true;
        let outcome = orchestrator.run(&ctx, req).await.unwrap();

        assert_eq!(outcome.status, BatchStatus::Completed);
        assert_eq!(outcome.tasks_completed, 3);
        assert_eq!(outcome.loops_completed, 1);
        assert_eq!(spawner.calls(), 3);
        assert_eq!(fx.history.count(HistoryKind::LoopSummary), 0);
        assert_eq!(read_doc(dir.path(), "polish.md").await, "- [ ] polish\n");
    }

    #[tokio::test]
    async fn test_reset_only_playbook_stops_at_max_loops() {
        let dir = TempDir::new().unwrap();
        write_doc(dir.path(), "polish.md", "- [ ] polish\n").await;

        let spawner = Arc::new(CheckFirstBox::default());
        let fx = fixture(spawner.clone(), Arc::new(MainCheckout));
        let orchestrator = BatchOrchestrator::new(OrchestratorConfig::default(), &fx.collaborators);
        let (_store, ctx) = context();

        let mut req = request(
            dir.path(),
            vec![DocumentEntry::new("polish.md").with_reset_on_completion()],
        );
        req.loop_enabled = true;
        req.max_loops = Some(3);
        let outcome = orchestrator.run(&ctx, req).await.unwrap();

        assert_eq!(outcome.tasks_completed, 3);
        assert_eq!(outcome.loops_completed, 3);
        assert_eq!(spawner.calls(), 3);
        // The final pass ends the loop without a summary
        assert_eq!(fx.history.count(HistoryKind::LoopSummary), 2);
        assert_eq!(read_doc(dir.path(), "polish.md").await, "- [ ] polish\n");
        assert_eq!(backup_count(dir.path()).await, 0);
    }

    #[tokio::test]
    async fn test_loop_without_progress_stalls_globally() {
        let dir = TempDir::new().unwrap();
        write_doc(dir.path(), "polish.md", "- [ ] polish\n").await;

        let spawner = Arc::new(NeverChanges::default());
        let fx = fixture(spawner.clone(), Arc::new(MainCheckout));
        let orchestrator = BatchOrchestrator::new(OrchestratorConfig::default(), &fx.collaborators);
        let (_store, ctx) = context();

        let mut req = request(
            dir.path(),
            vec![DocumentEntry::new("polish.md").with_reset_on_completion()],
        );
        req.loop_enabled = true;
        let outcome = orchestrator.run(&ctx, req).await.unwrap();

        assert_eq!(outcome.status, BatchStatus::Stalled);
        assert_eq!(spawner.calls(), 2);
        assert_eq!(backup_count(dir.path()).await, 0);
        assert_eq!(fx.history.count(HistoryKind::LoopSummary), 0);
    }

    #[tokio::test]
    async fn test_finalize_leaves_other_backups_alone() {
        let dir = TempDir::new().unwrap();
        write_doc(dir.path(), "polish.md", "- [ ] polish\n").await;
        write_doc(dir.path(), "other.backup.md", "kept by the user\n").await;
        tokio::fs::create_dir_all(dir.path().join("archive")).await.unwrap();
        write_doc(dir.path(), "archive/notes.backup.md", "- [ ] old\n").await;

        let spawner = Arc::new(CheckFirstBox::default());
        let fx = fixture(spawner.clone(), Arc::new(MainCheckout));
        let orchestrator = BatchOrchestrator::new(OrchestratorConfig::default(), &fx.collaborators);
        let (_store, ctx) = context();

        let outcome = orchestrator
            .run(
                &ctx,
                request(
                    dir.path(),
                    vec![DocumentEntry::new("polish.md").with_reset_on_completion()],
                ),
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, BatchStatus::Completed);
        assert_eq!(read_doc(dir.path(), "polish.md").await, "- [ ] polish\n");
        assert_eq!(backup_count(dir.path()).await, 1);
        assert_eq!(read_doc(dir.path(), "other.backup.md").await, "kept by the user\n");
        assert_eq!(read_doc(dir.path(), "archive/notes.backup.md").await, "- [ ] old\n");
    }

    #[tokio::test]
    async fn test_skip_resolved_between_documents() {
        let dir = TempDir::new().unwrap();
        write_doc(dir.path(), "first.md", "- [ ] a\n").await;
        write_doc(dir.path(), "second.md", "- [ ] b\n").await;

        /// Finishes the document, then reports an error against second.md
        /// that the operator answers with a skip
        struct FailsAhead {
            ctx: Arc<RunContext>,
            calls: std::sync::atomic::AtomicUsize,
        }

        #[async_trait]
        impl AgentSpawner for FailsAhead {
            async fn spawn(&self, request: SpawnRequest) -> SpawnResult {
                self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                check_first_box(Path::new(&request.prompt)).await;
                self.ctx
                    .pause_on_error(BatchRunError {
                        document_index: 1,
                        ..Default::default()
                    })
                    .await
                    .unwrap();
                self.ctx.resolve(ErrorResolution::SkipDocument).await.unwrap();
                SpawnResult::succeeded("ok")
            }
        }

        let store = Arc::new(BatchStateStore::new());
        let ctx = Arc::new(RunContext::new("s1", Arc::clone(&store)));
        let spawner = Arc::new(FailsAhead {
            ctx: Arc::clone(&ctx),
            calls: Default::default(),
        });
        let fx = fixture(spawner.clone(), Arc::new(MainCheckout));
        let orchestrator = BatchOrchestrator::new(OrchestratorConfig::default(), &fx.collaborators);

        let outcome = orchestrator
            .run(
                &ctx,
                request(
                    dir.path(),
                    vec![DocumentEntry::new("first.md"), DocumentEntry::new("second.md")],
                ),
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, BatchStatus::Completed);
        assert_eq!(outcome.tasks_completed, 1);
        assert_eq!(spawner.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(read_doc(dir.path(), "second.md").await, "- [ ] b\n");
        assert!(store.get("s1").await.is_none());
    }

    #[tokio::test]
    async fn test_worktree_setup_failure() {
        let dir = TempDir::new().unwrap();
        write_doc(dir.path(), "setup.md", "- [ ] a\n").await;

        let spawner = Arc::new(CheckFirstBox::default());
        let worktrees = Arc::new(FakeWorktrees {
            fail_setup: true,
            ..Default::default()
        });
        let fx = fixture(spawner.clone(), worktrees);
        let orchestrator = BatchOrchestrator::new(OrchestratorConfig::default(), &fx.collaborators);
        let (store, ctx) = context();

        let mut req = request(dir.path(), vec![DocumentEntry::new("setup.md")]);
        req.worktree = Some(WorktreeRequest {
            path: dir.path().join("wt"),
            branch: "autorun/setup".to_string(),
            base_branch: None,
            create_pr_on_completion: true,
            pr_target_branch: None,
            draft_pr: false,
        });
        let result = orchestrator.run(&ctx, req).await;

        assert!(matches!(result, Err(ExecutorError::SetupFailed { .. })));
        assert_eq!(spawner.calls(), 0);
        assert!(store.get("s1").await.is_none());
    }

    #[tokio::test]
    async fn test_worktree_run_opens_pull_request() {
        let dir = TempDir::new().unwrap();
        write_doc(dir.path(), "setup.md", "- [ ] a\n- [ ] b\n").await;

        let worktrees = Arc::new(FakeWorktrees::default());
        let fx = fixture(Arc::new(CheckFirstBox::default()), worktrees.clone());
        let orchestrator = BatchOrchestrator::new(OrchestratorConfig::default(), &fx.collaborators);
        let (_store, ctx) = context();

        let mut req = request(dir.path(), vec![DocumentEntry::new("setup.md")]);
        req.worktree = Some(WorktreeRequest {
            path: dir.path().join("wt"),
            branch: "autorun/setup".to_string(),
            base_branch: None,
            create_pr_on_completion: true,
            pr_target_branch: Some("main".to_string()),
            draft_pr: true,
        });
        let outcome = orchestrator.run(&ctx, req).await.unwrap();

        assert_eq!(outcome.pr_url.as_deref(), Some("https://github.com/acme/app/pull/7"));
        let pull_requests = worktrees.pull_requests.lock().unwrap().clone();
        assert_eq!(pull_requests.len(), 1);
        assert_eq!(pull_requests[0].title, "Auto Run: agent");
        assert_eq!(pull_requests[0].base_branch.as_deref(), Some("main"));
        assert!(pull_requests[0].draft);
        assert!(pull_requests[0].body.contains("Completed 2 tasks across 1 document."));
        assert_eq!(fx.history.count(HistoryKind::PullRequest), 1);
    }
}
