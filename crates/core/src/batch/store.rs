//! Per-session batch run store
//!
//! Every mutation goes through [`next_state`] with the event it implies. An
//! illegal event still applies the data-only fields of its payload (progress
//! counters, timing) but leaves the state and the state-linked fields alone.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::model::{
    BatchRun, BatchRunError, ErrorResolution, ProgressSnapshot, ProgressUpdate, RunTiming,
    StartBatchParams, WorktreeInfo,
};
use super::state_machine::{next_state, BatchEvent, BatchEventKind, ProcessingState};
use crate::{Error, Result};

/// Receives a snapshot pair after every store mutation
///
/// `current` is `None` once the run has been finalized and removed.
pub trait StoreObserver: Send + Sync {
    fn on_change(
        &self,
        session_id: &str,
        previous: Option<&ProgressSnapshot>,
        current: Option<&ProgressSnapshot>,
    );
}

/// Outcome of dispatching one event against a run
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Applied {
        from: ProcessingState,
        to: ProcessingState,
    },
    /// The event was illegal from `state`; only data-only fields were applied
    Rejected {
        state: ProcessingState,
        event: BatchEventKind,
    },
    /// The session has no run
    NoRun,
}

impl Dispatch {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// Shared map of batch runs keyed by session id
#[derive(Default)]
pub struct BatchStateStore {
    runs: RwLock<HashMap<String, BatchRun>>,
    observer: Option<Arc<dyn StoreObserver>>,
}

impl BatchStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_observer(observer: Arc<dyn StoreObserver>) -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            observer: Some(observer),
        }
    }

    pub async fn get(&self, session_id: &str) -> Option<BatchRun> {
        self.runs.read().await.get(session_id).cloned()
    }

    pub async fn snapshot(&self, session_id: &str) -> Option<ProgressSnapshot> {
        self.runs.read().await.get(session_id).map(BatchRun::snapshot)
    }

    pub async fn snapshots(&self) -> Vec<ProgressSnapshot> {
        let runs = self.runs.read().await;
        let mut snapshots: Vec<ProgressSnapshot> = runs.values().map(BatchRun::snapshot).collect();
        snapshots.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        snapshots
    }

    /// Current state of a session, `Idle` when it has no run
    pub async fn state(&self, session_id: &str) -> ProcessingState {
        self.runs
            .read()
            .await
            .get(session_id)
            .map(|run| run.state)
            .unwrap_or_default()
    }

    pub async fn is_active(&self, session_id: &str) -> bool {
        self.state(session_id).await.is_active()
    }

    /// Create the run record and dispatch START_BATCH
    pub async fn start_batch(&self, session_id: &str, params: StartBatchParams) -> Result<Dispatch> {
        let (dispatch, snapshot) = {
            let mut runs = self.runs.write().await;
            if runs.get(session_id).is_some_and(|run| run.state.is_active()) {
                return Err(Error::RunAlreadyActive(session_id.to_string()));
            }
            let mut run = BatchRun::new(session_id, &params);
            let dispatch = apply_event(&mut run, &BatchEvent::StartBatch(params));
            let snapshot = run.snapshot();
            runs.insert(session_id.to_string(), run);
            (dispatch, snapshot)
        };
        debug!(session_id, ?dispatch, "Batch run created");
        self.notify(session_id, None, Some(&snapshot));
        Ok(dispatch)
    }

    /// INITIALIZATION_COMPLETE
    pub async fn set_running(&self, session_id: &str, worktree: Option<WorktreeInfo>) -> Dispatch {
        self.dispatch(session_id, BatchEvent::InitializationComplete { worktree })
            .await
    }

    /// INITIALIZATION_FAILED; the record is dropped when the run returns to idle
    pub async fn set_initialization_failed(&self, session_id: &str, reason: &str) -> Dispatch {
        let dispatch = self
            .dispatch(
                session_id,
                BatchEvent::InitializationFailed {
                    reason: reason.to_string(),
                },
            )
            .await;
        if dispatch.is_applied() {
            self.remove(session_id).await;
        }
        dispatch
    }

    /// TASK_COMPLETED, or DOCUMENT_ADVANCED when the update moves to another document
    pub async fn update_progress(&self, session_id: &str, update: ProgressUpdate) -> Dispatch {
        let current_index = self
            .runs
            .read()
            .await
            .get(session_id)
            .map(|run| run.current_document_index);

        let event = match (update.current_document_index, current_index) {
            (Some(next), Some(current)) if next != current => BatchEvent::DocumentAdvanced(update),
            _ => BatchEvent::TaskCompleted(update),
        };
        self.dispatch(session_id, event).await
    }

    /// STOP_REQUESTED
    pub async fn set_stopping(&self, session_id: &str) -> Dispatch {
        self.dispatch(session_id, BatchEvent::StopRequested).await
    }

    /// ABORT_REQUESTED
    pub async fn abort(&self, session_id: &str) -> Dispatch {
        self.dispatch(session_id, BatchEvent::AbortRequested).await
    }

    /// ERROR_OCCURRED
    pub async fn set_error(&self, session_id: &str, error: BatchRunError) -> Dispatch {
        self.dispatch(session_id, BatchEvent::ErrorOccurred(error))
            .await
    }

    /// ERROR_RESOLVED, DOCUMENT_SKIPPED or ABORT_REQUESTED depending on the decision
    pub async fn clear_error(&self, session_id: &str, resolution: ErrorResolution) -> Dispatch {
        let event = match resolution {
            ErrorResolution::Resume => BatchEvent::ErrorResolved,
            ErrorResolution::SkipDocument => BatchEvent::DocumentSkipped,
            ErrorResolution::Abort => BatchEvent::AbortRequested,
        };
        self.dispatch(session_id, event).await
    }

    /// ALL_TASKS_DONE from RUNNING, CURRENT_TASK_DONE from STOPPING
    pub async fn set_completing(&self, session_id: &str) -> Dispatch {
        let event = match self.state(session_id).await {
            ProcessingState::Stopping => BatchEvent::CurrentTaskDone,
            _ => BatchEvent::AllTasksDone,
        };
        self.dispatch(session_id, event).await
    }

    /// LOOP_COMPLETED with the re-scanned task total
    pub async fn increment_loop(&self, session_id: &str, total_tasks: u32) -> Dispatch {
        let loop_iteration = self
            .runs
            .read()
            .await
            .get(session_id)
            .map(|run| run.loop_iteration + 1)
            .unwrap_or(1);
        self.dispatch(
            session_id,
            BatchEvent::LoopCompleted {
                loop_iteration,
                total_tasks,
            },
        )
        .await
    }

    pub async fn record_agent_session(&self, session_id: &str, agent_session_id: &str) {
        self.mutate(session_id, |run| {
            if !run
                .spawned_agent_session_ids
                .iter()
                .any(|id| id == agent_session_id)
            {
                run.spawned_agent_session_ids
                    .push(agent_session_id.to_string());
            }
        })
        .await;
    }

    pub async fn update_timing(&self, session_id: &str, timing: RunTiming) {
        self.mutate(session_id, |run| run.timing = timing).await;
    }

    /// Finalize the run and remove its record
    ///
    /// Drives RUNNING → COMPLETING → IDLE, STOPPING → COMPLETING → IDLE or
    /// COMPLETING → IDLE. From any other state the record is still reset and
    /// removed. Returns the record as it stood before the counters were reset.
    pub async fn complete_batch(&self, session_id: &str) -> Option<BatchRun> {
        let (finished, previous) = {
            let mut runs = self.runs.write().await;
            let run = runs.get_mut(session_id)?;
            let previous = run.snapshot();

            let first_hop = match run.state {
                ProcessingState::Running => Some(BatchEvent::AllTasksDone),
                ProcessingState::Stopping => Some(BatchEvent::CurrentTaskDone),
                _ => None,
            };
            if let Some(event) = first_hop {
                log_rejection(session_id, apply_event(run, &event));
            }

            let finished = run.clone();
            let dispatch = apply_event(run, &BatchEvent::BatchFinalized);
            if !dispatch.is_applied() {
                warn!(
                    session_id,
                    state = %run.state,
                    "Finalizing batch run from an unexpected state"
                );
                run.reset_counters();
                run.state = ProcessingState::Idle;
            }
            runs.remove(session_id);
            (finished, previous)
        };

        self.notify(session_id, Some(&previous), None);
        Some(BatchRun {
            state: ProcessingState::Idle,
            error: None,
            ..finished
        })
    }

    async fn remove(&self, session_id: &str) {
        let removed = self.runs.write().await.remove(session_id);
        if let Some(run) = removed {
            self.notify(session_id, Some(&run.snapshot()), None);
        }
    }

    async fn mutate(&self, session_id: &str, f: impl FnOnce(&mut BatchRun)) {
        let change = {
            let mut runs = self.runs.write().await;
            runs.get_mut(session_id).map(|run| {
                let previous = run.snapshot();
                f(run);
                (previous, run.snapshot())
            })
        };
        if let Some((previous, current)) = change {
            self.notify(session_id, Some(&previous), Some(&current));
        }
    }

    async fn dispatch(&self, session_id: &str, event: BatchEvent) -> Dispatch {
        let change = {
            let mut runs = self.runs.write().await;
            runs.get_mut(session_id).map(|run| {
                let previous = run.snapshot();
                let dispatch = apply_event(run, &event);
                (dispatch, previous, run.snapshot())
            })
        };

        let Some((dispatch, previous, current)) = change else {
            debug!(session_id, event = ?event.kind(), "No batch run for event");
            return Dispatch::NoRun;
        };

        log_rejection(session_id, dispatch);
        self.notify(session_id, Some(&previous), Some(&current));
        dispatch
    }

    fn notify(
        &self,
        session_id: &str,
        previous: Option<&ProgressSnapshot>,
        current: Option<&ProgressSnapshot>,
    ) {
        if let Some(observer) = &self.observer {
            observer.on_change(session_id, previous, current);
        }
    }
}

fn log_rejection(session_id: &str, dispatch: Dispatch) {
    if let Dispatch::Rejected { state, event } = dispatch {
        warn!(session_id, %state, ?event, "Ignoring invalid batch state transition");
    }
}

/// Apply `event` to `run`, honouring the transition table
fn apply_event(run: &mut BatchRun, event: &BatchEvent) -> Dispatch {
    if let BatchEvent::TaskCompleted(update) | BatchEvent::DocumentAdvanced(update) = event {
        run.apply_progress(update);
    }

    let from = run.state;
    let Some(to) = next_state(from, event.kind()) else {
        return Dispatch::Rejected {
            state: from,
            event: event.kind(),
        };
    };

    run.state = to;
    match event {
        BatchEvent::InitializationComplete { worktree } => run.worktree = worktree.clone(),
        BatchEvent::ErrorOccurred(error) => run.error = Some(error.clone()),
        BatchEvent::ErrorResolved | BatchEvent::DocumentSkipped | BatchEvent::AbortRequested => {
            run.error = None;
        }
        BatchEvent::LoopCompleted {
            loop_iteration,
            total_tasks,
        } => {
            run.loop_iteration = *loop_iteration;
            run.total_tasks_across_all_docs =
                (*total_tasks).max(run.completed_tasks_across_all_docs);
        }
        BatchEvent::InitializationFailed { .. } | BatchEvent::BatchFinalized => {
            run.reset_counters();
        }
        _ => {}
    }

    Dispatch::Applied { from, to }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::model::{AgentError, AgentErrorKind, DocumentEntry};
    use std::path::PathBuf;
    use std::sync::Mutex;

    fn params(total_tasks: u32) -> StartBatchParams {
        StartBatchParams {
            session_name: "agent".to_string(),
            folder_path: PathBuf::from("/tmp/playbooks"),
            documents: vec![DocumentEntry::new("a.md"), DocumentEntry::new("b.md")],
            total_tasks,
            loop_enabled: false,
            max_loops: None,
        }
    }

    fn run_error() -> BatchRunError {
        BatchRunError {
            error: AgentError::new(AgentErrorKind::RateLimited, "429", "agent-1"),
            document_index: 0,
            task_description: Some("Write docs".to_string()),
        }
    }

    async fn running_store(total_tasks: u32) -> BatchStateStore {
        let store = BatchStateStore::new();
        store.start_batch("s1", params(total_tasks)).await.unwrap();
        assert!(store.set_running("s1", None).await.is_applied());
        store
    }

    #[derive(Default)]
    struct Recorder {
        changes: Mutex<Vec<(Option<ProcessingState>, Option<ProcessingState>)>>,
    }

    impl StoreObserver for Recorder {
        fn on_change(
            &self,
            _session_id: &str,
            previous: Option<&ProgressSnapshot>,
            current: Option<&ProgressSnapshot>,
        ) {
            self.changes
                .lock()
                .unwrap()
                .push((previous.map(|s| s.state), current.map(|s| s.state)));
        }
    }

    #[tokio::test]
    async fn test_start_batch_twice_is_rejected() {
        let store = running_store(3).await;
        let result = store.start_batch("s1", params(3)).await;
        assert!(matches!(result, Err(Error::RunAlreadyActive(_))));

        store.start_batch("s2", params(3)).await.unwrap();
        assert_eq!(store.state("s2").await, ProcessingState::Initializing);
    }

    #[tokio::test]
    async fn test_progress_keeps_completed_within_total() {
        let store = running_store(2).await;

        for completed in 1..=5 {
            let dispatch = store
                .update_progress(
                    "s1",
                    ProgressUpdate {
                        completed_tasks_across_all_docs: Some(completed),
                        ..Default::default()
                    },
                )
                .await;
            assert!(dispatch.is_applied());

            let run = store.get("s1").await.unwrap();
            assert!(run.completed_tasks_across_all_docs <= run.total_tasks_across_all_docs);
        }
        assert_eq!(store.get("s1").await.unwrap().total_tasks_across_all_docs, 5);
    }

    #[tokio::test]
    async fn test_progress_applies_data_while_stopping() {
        let store = running_store(3).await;
        assert!(store.set_stopping("s1").await.is_applied());

        let dispatch = store
            .update_progress(
                "s1",
                ProgressUpdate {
                    completed_tasks_across_all_docs: Some(1),
                    ..Default::default()
                },
            )
            .await;

        assert_eq!(
            dispatch,
            Dispatch::Rejected {
                state: ProcessingState::Stopping,
                event: BatchEventKind::TaskCompleted,
            }
        );
        let run = store.get("s1").await.unwrap();
        assert_eq!(run.state, ProcessingState::Stopping);
        assert_eq!(run.completed_tasks_across_all_docs, 1);
    }

    #[tokio::test]
    async fn test_document_change_dispatches_document_advanced() {
        let store = running_store(3).await;
        assert!(store.set_stopping("s1").await.is_applied());

        let dispatch = store
            .update_progress(
                "s1",
                ProgressUpdate {
                    current_document_index: Some(1),
                    ..Default::default()
                },
            )
            .await;
        assert_eq!(
            dispatch,
            Dispatch::Rejected {
                state: ProcessingState::Stopping,
                event: BatchEventKind::DocumentAdvanced,
            }
        );
    }

    #[tokio::test]
    async fn test_error_is_present_only_while_paused() {
        let store = running_store(3).await;

        assert!(store.set_error("s1", run_error()).await.is_applied());
        let run = store.get("s1").await.unwrap();
        assert_eq!(run.state, ProcessingState::PausedError);
        assert_eq!(
            run.error.as_ref().and_then(|e| e.task_description.as_deref()),
            Some("Write docs")
        );

        assert!(store
            .clear_error("s1", ErrorResolution::SkipDocument)
            .await
            .is_applied());
        let run = store.get("s1").await.unwrap();
        assert_eq!(run.state, ProcessingState::Running);
        assert!(run.error.is_none());

        // Not legal from STOPPING, so the error must not be recorded
        assert!(store.set_stopping("s1").await.is_applied());
        assert!(!store.set_error("s1", run_error()).await.is_applied());
        assert!(store.get("s1").await.unwrap().error.is_none());
    }

    #[tokio::test]
    async fn test_abort_from_paused_error() {
        let store = running_store(3).await;
        assert!(store.set_error("s1", run_error()).await.is_applied());

        assert!(store.abort("s1").await.is_applied());
        let run = store.get("s1").await.unwrap();
        assert_eq!(run.state, ProcessingState::Stopping);
        assert!(run.error.is_none());
    }

    #[tokio::test]
    async fn test_complete_batch_from_each_finishing_state() {
        // RUNNING
        let store = running_store(3).await;
        let finished = store.complete_batch("s1").await.unwrap();
        assert_eq!(finished.state, ProcessingState::Idle);
        assert!(store.get("s1").await.is_none());

        // STOPPING
        let store = running_store(3).await;
        assert!(store.set_stopping("s1").await.is_applied());
        assert!(store.complete_batch("s1").await.is_some());
        assert!(!store.is_active("s1").await);

        // COMPLETING
        let store = running_store(3).await;
        assert!(store.set_completing("s1").await.is_applied());
        assert_eq!(store.state("s1").await, ProcessingState::Completing);
        assert!(store.complete_batch("s1").await.is_some());
        assert!(store.get("s1").await.is_none());
    }

    #[tokio::test]
    async fn test_complete_batch_from_paused_error_still_clears() {
        let store = running_store(3).await;
        assert!(store.set_error("s1", run_error()).await.is_applied());

        let finished = store.complete_batch("s1").await.unwrap();
        assert!(finished.error.is_none());
        assert!(store.get("s1").await.is_none());
        assert!(store.complete_batch("s1").await.is_none());
    }

    #[tokio::test]
    async fn test_set_completing_from_stopping_uses_current_task_done() {
        let store = running_store(3).await;
        assert!(store.set_stopping("s1").await.is_applied());
        assert_eq!(
            store.set_completing("s1").await,
            Dispatch::Applied {
                from: ProcessingState::Stopping,
                to: ProcessingState::Completing,
            }
        );
    }

    #[tokio::test]
    async fn test_initialization_failure_drops_record() {
        let store = BatchStateStore::new();
        store.start_batch("s1", params(3)).await.unwrap();
        assert!(store
            .set_initialization_failed("s1", "worktree busy")
            .await
            .is_applied());
        assert!(store.get("s1").await.is_none());
    }

    #[tokio::test]
    async fn test_increment_loop_updates_totals() {
        let store = running_store(3).await;
        store
            .update_progress(
                "s1",
                ProgressUpdate {
                    completed_tasks_across_all_docs: Some(3),
                    ..Default::default()
                },
            )
            .await
            .is_applied();

        assert!(store.increment_loop("s1", 5).await.is_applied());
        let run = store.get("s1").await.unwrap();
        assert_eq!(run.loop_iteration, 1);
        assert_eq!(run.total_tasks_across_all_docs, 5);
    }

    #[tokio::test]
    async fn test_record_agent_session_deduplicates() {
        let store = running_store(3).await;
        store.record_agent_session("s1", "claude-1").await;
        store.record_agent_session("s1", "claude-1").await;
        store.record_agent_session("s1", "claude-2").await;
        assert_eq!(
            store.get("s1").await.unwrap().spawned_agent_session_ids,
            vec!["claude-1".to_string(), "claude-2".to_string()]
        );
    }

    #[tokio::test]
    async fn test_observer_sees_every_change_and_final_none() {
        let recorder = Arc::new(Recorder::default());
        let store = BatchStateStore::with_observer(recorder.clone());

        store.start_batch("s1", params(1)).await.unwrap();
        assert!(store.set_running("s1", None).await.is_applied());
        store.complete_batch("s1").await;

        let changes = recorder.changes.lock().unwrap().clone();
        assert_eq!(
            changes,
            vec![
                (None, Some(ProcessingState::Initializing)),
                (
                    Some(ProcessingState::Initializing),
                    Some(ProcessingState::Running)
                ),
                (Some(ProcessingState::Running), None),
            ]
        );
    }

    #[tokio::test]
    async fn test_events_for_unknown_session() {
        let store = BatchStateStore::new();
        assert_eq!(store.set_stopping("missing").await, Dispatch::NoRun);
        assert_eq!(store.state("missing").await, ProcessingState::Idle);
    }
}
