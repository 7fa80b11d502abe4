//! Batch run data model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;
use std::path::PathBuf;

use super::state_machine::ProcessingState;

/// A task document taking part in a batch run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentEntry {
    pub filename: String,
    /// Revert the document's checkmarks once all its tasks are done so it can
    /// be processed again on the next loop iteration
    #[serde(default)]
    pub reset_on_completion: bool,
}

impl DocumentEntry {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            reset_on_completion: false,
        }
    }

    pub fn with_reset_on_completion(mut self) -> Self {
        self.reset_on_completion = true;
        self
    }
}

/// Isolated worktree a run is working in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeInfo {
    pub active: bool,
    pub path: PathBuf,
    pub branch: String,
}

/// Category of an agent failure
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentErrorKind {
    AuthExpired,
    TokenExhaustion,
    RateLimited,
    NetworkError,
    AgentCrashed,
    PermissionDenied,
    SessionNotFound,
    #[default]
    Unknown,
}

impl AgentErrorKind {
    /// Whether a run can reasonably continue after the operator deals with it
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::AuthExpired | Self::PermissionDenied)
    }
}

/// An error reported by an agent process
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentError {
    pub kind: AgentErrorKind,
    pub message: String,
    pub recoverable: bool,
    pub originating_agent_id: String,
    pub timestamp: DateTime<Utc>,
}

impl AgentError {
    pub fn new(
        kind: AgentErrorKind,
        message: impl Into<String>,
        originating_agent_id: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            recoverable: kind.is_recoverable(),
            originating_agent_id: originating_agent_id.into(),
            timestamp: Utc::now(),
        }
    }
}

/// The error a paused run is waiting on
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRunError {
    #[serde(flatten)]
    pub error: AgentError,
    pub document_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_description: Option<String>,
}

/// Operator decision for a paused run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorResolution {
    Resume,
    SkipDocument,
    Abort,
}

/// Token and cost accounting reported by an agent
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_creation_tokens: u64,
    #[serde(default)]
    pub total_cost_usd: f64,
}

impl UsageStats {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_read_tokens + self.cache_creation_tokens
    }

    pub fn is_empty(&self) -> bool {
        self.total_tokens() == 0 && self.total_cost_usd == 0.0
    }
}

impl AddAssign for UsageStats {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
        self.cache_read_tokens += rhs.cache_read_tokens;
        self.cache_creation_tokens += rhs.cache_creation_tokens;
        self.total_cost_usd += rhs.total_cost_usd;
    }
}

/// Timing of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTiming {
    /// Wall-clock time, excluding periods the host was suspended
    pub accumulated_elapsed_ms: u64,
    pub last_active_at: Option<DateTime<Utc>>,
    /// Sum of the actual duration of every task
    pub cumulative_task_time_ms: u64,
}

/// Parameters of a START_BATCH event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartBatchParams {
    pub session_name: String,
    pub folder_path: PathBuf,
    pub documents: Vec<DocumentEntry>,
    pub total_tasks: u32,
    pub loop_enabled: bool,
    pub max_loops: Option<u32>,
}

/// Partial progress update; `None` fields are left as they are
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub current_document_index: Option<usize>,
    pub current_doc_tasks_total: Option<u32>,
    pub current_doc_tasks_completed: Option<u32>,
    pub total_tasks_across_all_docs: Option<u32>,
    pub completed_tasks_across_all_docs: Option<u32>,
    pub timing: Option<RunTiming>,
}

/// The batch run record of one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRun {
    pub session_id: String,
    pub session_name: String,
    pub state: ProcessingState,
    pub folder_path: PathBuf,
    pub documents: Vec<DocumentEntry>,
    pub current_document_index: usize,
    pub current_doc_tasks_total: u32,
    pub current_doc_tasks_completed: u32,
    pub total_tasks_across_all_docs: u32,
    pub completed_tasks_across_all_docs: u32,
    pub loop_enabled: bool,
    pub loop_iteration: u32,
    pub max_loops: Option<u32>,
    pub worktree: Option<WorktreeInfo>,
    pub timing: RunTiming,
    pub error: Option<BatchRunError>,
    pub spawned_agent_session_ids: Vec<String>,
    pub started_at: DateTime<Utc>,
}

impl BatchRun {
    /// Build an idle record from START_BATCH parameters
    pub fn new(session_id: impl Into<String>, params: &StartBatchParams) -> Self {
        Self {
            session_id: session_id.into(),
            session_name: params.session_name.clone(),
            state: ProcessingState::Idle,
            folder_path: params.folder_path.clone(),
            documents: params.documents.clone(),
            current_document_index: 0,
            current_doc_tasks_total: 0,
            current_doc_tasks_completed: 0,
            total_tasks_across_all_docs: params.total_tasks,
            completed_tasks_across_all_docs: 0,
            loop_enabled: params.loop_enabled,
            loop_iteration: 0,
            max_loops: params.max_loops,
            worktree: None,
            timing: RunTiming::default(),
            error: None,
            spawned_agent_session_ids: Vec::new(),
            started_at: Utc::now(),
        }
    }

    pub fn current_document(&self) -> Option<&DocumentEntry> {
        self.documents.get(self.current_document_index)
    }

    /// Apply the data-only fields of a progress update
    ///
    /// Document indices outside the document list are ignored and the
    /// completed counters never exceed their totals.
    pub fn apply_progress(&mut self, update: &ProgressUpdate) {
        if let Some(index) = update.current_document_index {
            if index < self.documents.len() {
                self.current_document_index = index;
            } else {
                tracing::warn!(
                    session_id = %self.session_id,
                    index,
                    documents = self.documents.len(),
                    "Ignoring out-of-range document index"
                );
            }
        }
        if let Some(total) = update.current_doc_tasks_total {
            self.current_doc_tasks_total = total;
        }
        if let Some(completed) = update.current_doc_tasks_completed {
            self.current_doc_tasks_completed = completed;
        }
        if let Some(total) = update.total_tasks_across_all_docs {
            self.total_tasks_across_all_docs = total;
        }
        if let Some(completed) = update.completed_tasks_across_all_docs {
            self.completed_tasks_across_all_docs = completed;
        }
        if let Some(timing) = update.timing {
            self.timing = timing;
        }

        self.current_doc_tasks_total = self
            .current_doc_tasks_total
            .max(self.current_doc_tasks_completed);
        self.total_tasks_across_all_docs = self
            .total_tasks_across_all_docs
            .max(self.completed_tasks_across_all_docs);
    }

    /// Clear everything finalization is required to clear
    pub fn reset_counters(&mut self) {
        self.current_document_index = 0;
        self.current_doc_tasks_total = 0;
        self.current_doc_tasks_completed = 0;
        self.total_tasks_across_all_docs = 0;
        self.completed_tasks_across_all_docs = 0;
        self.loop_iteration = 0;
        self.worktree = None;
        self.error = None;
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            session_id: self.session_id.clone(),
            session_name: self.session_name.clone(),
            state: self.state,
            is_running: self.state.is_active(),
            is_stopping: self.state == ProcessingState::Stopping,
            is_paused: self.state == ProcessingState::PausedError,
            documents: self.documents.iter().map(|d| d.filename.clone()).collect(),
            current_document_index: self.current_document_index,
            current_document: self.current_document().map(|d| d.filename.clone()),
            current_doc_tasks_total: self.current_doc_tasks_total,
            current_doc_tasks_completed: self.current_doc_tasks_completed,
            total_tasks: self.total_tasks_across_all_docs,
            completed_tasks: self.completed_tasks_across_all_docs,
            loop_enabled: self.loop_enabled,
            loop_iteration: self.loop_iteration,
            max_loops: self.max_loops,
            worktree_active: self.worktree.as_ref().is_some_and(|w| w.active),
            worktree_branch: self.worktree.as_ref().map(|w| w.branch.clone()),
            error: self.error.clone(),
            elapsed_ms: self.timing.accumulated_elapsed_ms,
            cumulative_task_time_ms: self.timing.cumulative_task_time_ms,
            agent_session_count: self.spawned_agent_session_ids.len(),
        }
    }
}

/// What observers of a run get to see
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub session_id: String,
    pub session_name: String,
    pub state: ProcessingState,
    pub is_running: bool,
    pub is_stopping: bool,
    pub is_paused: bool,
    pub documents: Vec<String>,
    pub current_document_index: usize,
    pub current_document: Option<String>,
    pub current_doc_tasks_total: u32,
    pub current_doc_tasks_completed: u32,
    pub total_tasks: u32,
    pub completed_tasks: u32,
    pub loop_enabled: bool,
    pub loop_iteration: u32,
    pub max_loops: Option<u32>,
    pub worktree_active: bool,
    pub worktree_branch: Option<String>,
    pub error: Option<BatchRunError>,
    pub elapsed_ms: u64,
    pub cumulative_task_time_ms: u64,
    pub agent_session_count: usize,
}
