//! Batch processing state machine
//!
//! A pure transition function over [`ProcessingState`]. Nothing in here
//! touches I/O or shared state; the run store decides what to do with the
//! result.

use serde::{Deserialize, Serialize};

use super::model::{BatchRunError, ProgressUpdate, StartBatchParams, WorktreeInfo};

/// Processing state of a batch run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingState {
    #[default]
    Idle,
    Initializing,
    Running,
    PausedError,
    Stopping,
    Completing,
}

impl ProcessingState {
    /// Every state, in declaration order
    pub const ALL: [ProcessingState; 6] = [
        Self::Idle,
        Self::Initializing,
        Self::Running,
        Self::PausedError,
        Self::Stopping,
        Self::Completing,
    ];

    /// A run exists and has not been finalized
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Idle)
    }

    /// The run is winding down and will not pick up new tasks
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopping | Self::Completing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Initializing => "INITIALIZING",
            Self::Running => "RUNNING",
            Self::PausedError => "PAUSED_ERROR",
            Self::Stopping => "STOPPING",
            Self::Completing => "COMPLETING",
        }
    }
}

impl std::fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload-free discriminant of [`BatchEvent`], used for validity checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchEventKind {
    StartBatch,
    InitializationComplete,
    InitializationFailed,
    TaskCompleted,
    DocumentAdvanced,
    LoopCompleted,
    ErrorOccurred,
    ErrorResolved,
    DocumentSkipped,
    AbortRequested,
    StopRequested,
    AllTasksDone,
    CurrentTaskDone,
    BatchFinalized,
}

impl BatchEventKind {
    pub const ALL: [BatchEventKind; 14] = [
        Self::StartBatch,
        Self::InitializationComplete,
        Self::InitializationFailed,
        Self::TaskCompleted,
        Self::DocumentAdvanced,
        Self::LoopCompleted,
        Self::ErrorOccurred,
        Self::ErrorResolved,
        Self::DocumentSkipped,
        Self::AbortRequested,
        Self::StopRequested,
        Self::AllTasksDone,
        Self::CurrentTaskDone,
        Self::BatchFinalized,
    ];
}

/// An event dispatched against a batch run, carrying its real payload
#[derive(Debug, Clone, PartialEq)]
pub enum BatchEvent {
    StartBatch(StartBatchParams),
    InitializationComplete { worktree: Option<WorktreeInfo> },
    InitializationFailed { reason: String },
    TaskCompleted(ProgressUpdate),
    DocumentAdvanced(ProgressUpdate),
    LoopCompleted { loop_iteration: u32, total_tasks: u32 },
    ErrorOccurred(BatchRunError),
    ErrorResolved,
    DocumentSkipped,
    AbortRequested,
    StopRequested,
    AllTasksDone,
    CurrentTaskDone,
    BatchFinalized,
}

impl BatchEvent {
    pub fn kind(&self) -> BatchEventKind {
        match self {
            Self::StartBatch(_) => BatchEventKind::StartBatch,
            Self::InitializationComplete { .. } => BatchEventKind::InitializationComplete,
            Self::InitializationFailed { .. } => BatchEventKind::InitializationFailed,
            Self::TaskCompleted(_) => BatchEventKind::TaskCompleted,
            Self::DocumentAdvanced(_) => BatchEventKind::DocumentAdvanced,
            Self::LoopCompleted { .. } => BatchEventKind::LoopCompleted,
            Self::ErrorOccurred(_) => BatchEventKind::ErrorOccurred,
            Self::ErrorResolved => BatchEventKind::ErrorResolved,
            Self::DocumentSkipped => BatchEventKind::DocumentSkipped,
            Self::AbortRequested => BatchEventKind::AbortRequested,
            Self::StopRequested => BatchEventKind::StopRequested,
            Self::AllTasksDone => BatchEventKind::AllTasksDone,
            Self::CurrentTaskDone => BatchEventKind::CurrentTaskDone,
            Self::BatchFinalized => BatchEventKind::BatchFinalized,
        }
    }
}

/// Look up the target state for `kind` from `state`, if the pair is legal
pub fn next_state(state: ProcessingState, kind: BatchEventKind) -> Option<ProcessingState> {
    use BatchEventKind as E;
    use ProcessingState as S;

    match (state, kind) {
        (S::Idle, E::StartBatch) => Some(S::Initializing),
        (S::Initializing, E::InitializationComplete) => Some(S::Running),
        (S::Initializing, E::InitializationFailed) => Some(S::Idle),
        (S::Running, E::TaskCompleted | E::DocumentAdvanced | E::LoopCompleted) => {
            Some(S::Running)
        }
        (S::Running, E::ErrorOccurred) => Some(S::PausedError),
        (S::Running, E::StopRequested) => Some(S::Stopping),
        (S::Running, E::AllTasksDone) => Some(S::Completing),
        (S::PausedError, E::ErrorResolved | E::DocumentSkipped) => Some(S::Running),
        (S::PausedError, E::AbortRequested) => Some(S::Stopping),
        (S::Stopping, E::CurrentTaskDone) => Some(S::Completing),
        (S::Completing, E::BatchFinalized) => Some(S::Idle),
        _ => None,
    }
}

/// Whether `kind` is a legal event from `state`
pub fn can_transition(state: ProcessingState, kind: BatchEventKind) -> bool {
    next_state(state, kind).is_some()
}

/// Apply `event` to `state`. Illegal events leave the state unchanged.
pub fn transition(state: ProcessingState, event: &BatchEvent) -> ProcessingState {
    next_state(state, event.kind()).unwrap_or(state)
}
