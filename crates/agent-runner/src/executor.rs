//! Batch executor - owns every running batch and the operator surface

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use autorun_core::batch::{AgentError, BatchRunError, BatchStateStore, ErrorResolution, ProgressSnapshot};
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::batch::{
    BatchOrchestrator, BatchOutcome, BatchRequest, BroadcastDebouncer, Collaborators,
    OrchestratorConfig, RunContext,
};
use crate::error::{ExecutorError, Result};

/// Runs batches in the background, one per session
pub struct BatchExecutor {
    store: Arc<BatchStateStore>,
    orchestrator: Arc<BatchOrchestrator>,
    /// Run contexts by session ID
    contexts: Arc<RwLock<HashMap<String, Arc<RunContext>>>>,
    /// Signalled whenever a run leaves `contexts`
    finished: Arc<Notify>,
    debouncer: Arc<BroadcastDebouncer>,
}

impl BatchExecutor {
    /// Create an executor; must be called inside a tokio runtime
    pub fn new(config: OrchestratorConfig, collaborators: Collaborators) -> Self {
        let debouncer = Arc::new(BroadcastDebouncer::spawn(
            Arc::clone(&collaborators.broadcast),
            config.broadcast_debounce,
        ));
        let store = Arc::new(BatchStateStore::with_observer(debouncer.clone()));
        let orchestrator = Arc::new(BatchOrchestrator::new(config, &collaborators));

        Self {
            store,
            orchestrator,
            contexts: Arc::new(RwLock::new(HashMap::new())),
            finished: Arc::new(Notify::new()),
            debouncer,
        }
    }

    pub fn store(&self) -> &Arc<BatchStateStore> {
        &self.store
    }

    /// Start a batch in the background
    ///
    /// The handle resolves once the run is finalized.
    pub async fn start(&self, request: BatchRequest) -> Result<JoinHandle<Result<BatchOutcome>>> {
        let session_id = request.session_id.clone();
        if session_id.trim().is_empty() {
            return Err(ExecutorError::invalid_request("Session ID is required"));
        }

        let ctx = {
            let mut contexts = self.contexts.write().await;
            if contexts.contains_key(&session_id) || self.store.is_active(&session_id).await {
                return Err(ExecutorError::SessionExists { session_id });
            }
            let ctx = Arc::new(RunContext::new(session_id.clone(), Arc::clone(&self.store)));
            contexts.insert(session_id.clone(), Arc::clone(&ctx));
            ctx
        };

        info!(
            "Starting batch for session {} with {} document(s)",
            session_id,
            request.documents.len()
        );

        let orchestrator = Arc::clone(&self.orchestrator);
        let contexts = Arc::clone(&self.contexts);
        let finished = Arc::clone(&self.finished);

        Ok(tokio::spawn(async move {
            let result = orchestrator.run(&ctx, request).await;

            contexts.write().await.remove(&session_id);
            finished.notify_waiters();

            match &result {
                Ok(outcome) => info!(
                    "Batch for session {} ended: {} ({} task(s))",
                    session_id, outcome.status, outcome.tasks_completed
                ),
                Err(e) => error!("Batch for session {} failed: {}", session_id, e),
            }
            result
        }))
    }

    async fn context(&self, session_id: &str) -> Result<Arc<RunContext>> {
        self.contexts
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| ExecutorError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    /// Stop after the current task; a paused run is aborted
    pub async fn request_stop(&self, session_id: &str) -> Result<()> {
        self.context(session_id).await?.request_stop().await;
        Ok(())
    }

    /// Pause a run on an agent error until the operator decides
    pub async fn pause_on_error(
        &self,
        session_id: &str,
        error: AgentError,
        document_index: usize,
        task_description: Option<String>,
    ) -> Result<()> {
        self.context(session_id)
            .await?
            .pause_on_error(BatchRunError {
                error,
                document_index,
                task_description,
            })
            .await
    }

    pub async fn resume_after_error(&self, session_id: &str) -> Result<()> {
        self.resolve(session_id, ErrorResolution::Resume).await
    }

    pub async fn skip_current_document(&self, session_id: &str) -> Result<()> {
        self.resolve(session_id, ErrorResolution::SkipDocument).await
    }

    pub async fn abort_on_error(&self, session_id: &str) -> Result<()> {
        self.resolve(session_id, ErrorResolution::Abort).await
    }

    async fn resolve(&self, session_id: &str, resolution: ErrorResolution) -> Result<()> {
        self.context(session_id).await?.resolve(resolution).await
    }

    pub async fn snapshot(&self, session_id: &str) -> Option<ProgressSnapshot> {
        self.store.snapshot(session_id).await
    }

    /// Snapshots of every run, ordered by session ID
    pub async fn list(&self) -> Vec<ProgressSnapshot> {
        self.store.snapshots().await
    }

    /// Pause or resume elapsed-time tracking of every run
    ///
    /// Returns how many runs were affected.
    pub async fn set_suspended(&self, suspended: bool) -> usize {
        let contexts = self.contexts.read().await;
        for ctx in contexts.values() {
            ctx.tracker().set_suspended(suspended);
        }
        info!(suspended, runs = contexts.len(), "Host suspension changed");
        contexts.len()
    }

    pub async fn active_sessions(&self) -> Vec<String> {
        let mut sessions: Vec<String> = self.contexts.read().await.keys().cloned().collect();
        sessions.sort();
        sessions
    }

    /// Abort every run, wait up to `grace` for them to finalize, then flush broadcasts
    pub async fn shutdown(&self, grace: Duration) {
        let contexts: Vec<Arc<RunContext>> = self.contexts.read().await.values().cloned().collect();
        if !contexts.is_empty() {
            info!("Stopping {} batch run(s)", contexts.len());
        }
        for ctx in &contexts {
            ctx.request_stop().await;
        }

        let drained = tokio::time::timeout(grace, async {
            loop {
                let notified = self.finished.notified();
                if self.contexts.read().await.is_empty() {
                    break;
                }
                notified.await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                "Batch runs still finishing after {:?}: {:?}",
                grace,
                self.active_sessions().await
            );
        }

        self.debouncer.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::test_support::{
        check_first_box, fixture, read_doc, write_doc, MainCheckout, PATH_PROMPT,
    };
    use crate::spawner::{AgentSpawner, SpawnRequest, SpawnResult};
    use async_trait::async_trait;
    use autorun_core::batch::{AgentErrorKind, DocumentEntry, ProcessingState};
    use autorun_core::history::BatchStatus;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::sync::{mpsc, Semaphore};

    /// Announces each call and holds it until the test hands out a permit
    struct GatedSpawner {
        entered: mpsc::UnboundedSender<String>,
        gate: Arc<Semaphore>,
        prompts: Mutex<Vec<String>>,
    }

    impl GatedSpawner {
        fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>, Arc<Semaphore>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let gate = Arc::new(Semaphore::new(0));
            let spawner = Arc::new(Self {
                entered: tx,
                gate: Arc::clone(&gate),
                prompts: Mutex::new(Vec::new()),
            });
            (spawner, rx, gate)
        }

        fn calls_for(&self, filename: &str) -> usize {
            self.prompts
                .lock()
                .unwrap()
                .iter()
                .filter(|p| p.ends_with(filename))
                .count()
        }
    }

    #[async_trait]
    impl AgentSpawner for GatedSpawner {
        async fn spawn(&self, request: SpawnRequest) -> SpawnResult {
            self.prompts.lock().unwrap().push(request.prompt.clone());
            let _ = self.entered.send(request.prompt.clone());
            self.gate.acquire().await.unwrap().forget();
            check_first_box(Path::new(&request.prompt)).await;
            SpawnResult::succeeded("ok")
        }
    }

    /// Fails the first call, then checks boxes
    #[derive(Default)]
    struct FailsFirst {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AgentSpawner for FailsFirst {
        async fn spawn(&self, request: SpawnRequest) -> SpawnResult {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return SpawnResult::failed(AgentError::new(
                    AgentErrorKind::RateLimited,
                    "API Error: 429 rate_limit_error",
                    "claude-code",
                ));
            }
            check_first_box(Path::new(&request.prompt)).await;
            SpawnResult::succeeded("ok")
        }
    }

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

    fn config() -> OrchestratorConfig {
        OrchestratorConfig::default().with_broadcast_debounce(Duration::from_millis(10))
    }

    async fn wait_until_paused(executor: &BatchExecutor) -> ProgressSnapshot {
        for _ in 0..500 {
            if let Some(snapshot) = executor.snapshot("s1").await {
                if snapshot.is_paused {
                    return snapshot;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run never paused");
    }

    #[tokio::test]
    async fn test_skip_document_after_error() {
        let dir = TempDir::new().unwrap();
        write_doc(dir.path(), "a.md", "- [ ] a1\n- [ ] a2\n").await;
        write_doc(dir.path(), "b.md", "- [ ] b1\n").await;

        let (spawner, mut entered, gate) = GatedSpawner::new();
        let fx = fixture(spawner.clone(), Arc::new(MainCheckout));
        let broadcast = Arc::clone(&fx.broadcast);
        let executor = BatchExecutor::new(config(), fx.collaborators);

        let handle = executor
            .start(request(
                dir.path(),
                vec![DocumentEntry::new("a.md"), DocumentEntry::new("b.md")],
            ))
            .await
            .unwrap();

        assert!(entered.recv().await.unwrap().ends_with("a.md"));
        executor
            .pause_on_error(
                "s1",
                AgentError::new(AgentErrorKind::NetworkError, "ECONNRESET", "claude-code"),
                0,
                Some("a1".to_string()),
            )
            .await
            .unwrap();

        let snapshot = executor.snapshot("s1").await.unwrap();
        assert!(snapshot.is_paused);
        let error = snapshot.error.unwrap();
        assert_eq!(error.document_index, 0);
        assert_eq!(error.task_description.as_deref(), Some("a1"));

        gate.add_permits(1);
        executor.skip_current_document("s1").await.unwrap();
        let snapshot = executor.snapshot("s1").await.unwrap();
        assert!(snapshot.error.is_none());
        assert_eq!(snapshot.state, ProcessingState::Running);

        assert!(entered.recv().await.unwrap().ends_with("b.md"));
        gate.add_permits(1);

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.status, BatchStatus::Completed);
        assert_eq!(outcome.tasks_completed, 2);
        assert_eq!(spawner.calls_for("a.md"), 1);
        assert_eq!(spawner.calls_for("b.md"), 1);
        assert_eq!(read_doc(dir.path(), "a.md").await, "- [x] a1\n- [ ] a2\n");
        assert!(executor.snapshot("s1").await.is_none());

        executor.shutdown(Duration::from_secs(1)).await;
        let pushes = broadcast.pushes();
        assert!(pushes.iter().any(|(_, s)| s.as_ref().is_some_and(|s| s.is_paused)));
        assert_eq!(pushes.last().unwrap(), &("s1".to_string(), None));
    }

    #[tokio::test]
    async fn test_agent_error_pauses_until_resumed() {
        let dir = TempDir::new().unwrap();
        write_doc(dir.path(), "a.md", "- [ ] a1\n").await;

        let spawner = Arc::new(FailsFirst::default());
        let fx = fixture(spawner.clone(), Arc::new(MainCheckout));
        let executor = BatchExecutor::new(config(), fx.collaborators);

        let handle = executor
            .start(request(dir.path(), vec![DocumentEntry::new("a.md")]))
            .await
            .unwrap();

        let snapshot = wait_until_paused(&executor).await;
        let error = snapshot.error.unwrap();
        assert_eq!(error.error.kind, AgentErrorKind::RateLimited);
        assert_eq!(error.task_description.as_deref(), Some("a1"));

        executor.resume_after_error("s1").await.unwrap();
        let outcome = handle.await.unwrap().unwrap();

        assert_eq!(outcome.status, BatchStatus::Completed);
        assert_eq!(outcome.tasks_completed, 1);
        assert_eq!(spawner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_abort_on_error_stops_run() {
        let dir = TempDir::new().unwrap();
        write_doc(dir.path(), "a.md", "- [ ] a1\n- [ ] a2\n").await;
        write_doc(dir.path(), "b.md", "- [ ] b1\n").await;

        let spawner = Arc::new(FailsFirst::default());
        let fx = fixture(spawner.clone(), Arc::new(MainCheckout));
        let executor = BatchExecutor::new(config(), fx.collaborators);

        let handle = executor
            .start(request(
                dir.path(),
                vec![DocumentEntry::new("a.md"), DocumentEntry::new("b.md")],
            ))
            .await
            .unwrap();

        wait_until_paused(&executor).await;
        executor.abort_on_error("s1").await.unwrap();
        let outcome = handle.await.unwrap().unwrap();

        assert_eq!(outcome.status, BatchStatus::Stopped);
        assert_eq!(spawner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(read_doc(dir.path(), "b.md").await, "- [ ] b1\n");
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let dir = TempDir::new().unwrap();
        write_doc(dir.path(), "a.md", "- [ ] a1\n- [ ] a2\n").await;

        let (spawner, mut entered, gate) = GatedSpawner::new();
        let fx = fixture(spawner, Arc::new(MainCheckout));
        let executor = BatchExecutor::new(config(), fx.collaborators);

        let handle = executor
            .start(request(dir.path(), vec![DocumentEntry::new("a.md")]))
            .await
            .unwrap();
        entered.recv().await.unwrap();

        let second = executor
            .start(request(dir.path(), vec![DocumentEntry::new("a.md")]))
            .await;
        assert!(matches!(second, Err(ExecutorError::SessionExists { .. })));
        assert_eq!(executor.active_sessions().await, vec!["s1".to_string()]);

        executor.request_stop("s1").await.unwrap();
        assert!(executor.snapshot("s1").await.unwrap().is_stopping);
        gate.add_permits(1);

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.status, BatchStatus::Stopped);
        assert_eq!(outcome.tasks_completed, 1);
    }

    #[tokio::test]
    async fn test_shutdown_aborts_paused_runs() {
        let dir = TempDir::new().unwrap();
        write_doc(dir.path(), "a.md", "- [ ] a1\n- [ ] a2\n").await;

        let spawner = Arc::new(FailsFirst::default());
        let fx = fixture(spawner, Arc::new(MainCheckout));
        let executor = BatchExecutor::new(config(), fx.collaborators);

        let handle = executor
            .start(request(dir.path(), vec![DocumentEntry::new("a.md")]))
            .await
            .unwrap();
        wait_until_paused(&executor).await;

        executor.shutdown(Duration::from_secs(5)).await;
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.status, BatchStatus::Stopped);
        assert!(executor.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let fx = fixture(Arc::new(FailsFirst::default()), Arc::new(MainCheckout));
        let executor = BatchExecutor::new(config(), fx.collaborators);

        assert!(matches!(
            executor.request_stop("missing").await,
            Err(ExecutorError::SessionNotFound { .. })
        ));
        assert!(matches!(
            executor.resume_after_error("missing").await,
            Err(ExecutorError::SessionNotFound { .. })
        ));
        assert!(executor.snapshot("missing").await.is_none());
    }
}
