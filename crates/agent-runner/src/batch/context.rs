//! Per-session run context: cancellation and the error-resolution rendezvous

use std::sync::Arc;

use autorun_core::batch::{BatchRunError, BatchStateStore, ErrorResolution, TimeTracker};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{ExecutorError, Result};

#[derive(Default)]
struct PauseSlot {
    resolver: Option<oneshot::Sender<ErrorResolution>>,
    waiter: Option<oneshot::Receiver<ErrorResolution>>,
    /// Document the pending error was raised on
    document_index: Option<usize>,
}

/// Everything a running batch shares with the operator surface
pub struct RunContext {
    session_id: String,
    store: Arc<BatchStateStore>,
    cancel: CancellationToken,
    pause: Mutex<PauseSlot>,
    tracker: TimeTracker,
}

impl RunContext {
    pub fn new(session_id: impl Into<String>, store: Arc<BatchStateStore>) -> Self {
        Self {
            session_id: session_id.into(),
            store,
            cancel: CancellationToken::new(),
            pause: Mutex::new(PauseSlot::default()),
            tracker: TimeTracker::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn store(&self) -> &Arc<BatchStateStore> {
        &self.store
    }

    pub fn tracker(&self) -> &TimeTracker {
        &self.tracker
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_stop_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn is_paused(&self) -> bool {
        self.pause.lock().await.resolver.is_some()
    }

    /// Move the run into PAUSED_ERROR and arm the rendezvous
    pub async fn pause_on_error(&self, error: BatchRunError) -> Result<()> {
        let mut slot = self.pause.lock().await;
        if slot.resolver.is_some() {
            return Err(ExecutorError::NotRunning {
                session_id: self.session_id.clone(),
            });
        }

        let kind = error.error.kind;
        let document_index = error.document_index;
        if !self.store.set_error(&self.session_id, error).await.is_applied() {
            return Err(ExecutorError::NotRunning {
                session_id: self.session_id.clone(),
            });
        }

        let (tx, rx) = oneshot::channel();
        slot.resolver = Some(tx);
        slot.waiter = Some(rx);
        slot.document_index = Some(document_index);
        info!(session_id = %self.session_id, ?kind, "Batch run paused on error");
        Ok(())
    }

    /// Deliver the operator's decision to a paused run
    pub async fn resolve(&self, resolution: ErrorResolution) -> Result<()> {
        let mut slot = self.pause.lock().await;
        let Some(resolver) = slot.resolver.take() else {
            return Err(ExecutorError::NotPaused {
                session_id: self.session_id.clone(),
            });
        };

        let _ = self.store.clear_error(&self.session_id, resolution).await;
        if resolution == ErrorResolution::Abort {
            self.cancel.cancel();
        }
        let _ = resolver.send(resolution);
        info!(session_id = %self.session_id, ?resolution, "Batch run error resolved");
        Ok(())
    }

    /// Ask the run to stop after the current task
    ///
    /// A paused run is aborted instead.
    pub async fn request_stop(&self) {
        self.cancel.cancel();
        let mut slot = self.pause.lock().await;
        if let Some(resolver) = slot.resolver.take() {
            let _ = self
                .store
                .clear_error(&self.session_id, ErrorResolution::Abort)
                .await;
            let _ = resolver.send(ErrorResolution::Abort);
        } else {
            let _ = self.store.set_stopping(&self.session_id).await;
        }
        info!(session_id = %self.session_id, "Stop requested");
    }

    /// Document of an error the run has not yet waited out
    ///
    /// Still set after the operator resolves, until the run picks up the
    /// decision.
    pub async fn pending_error_document(&self) -> Option<usize> {
        let slot = self.pause.lock().await;
        slot.waiter.as_ref().and(slot.document_index)
    }

    /// Block while an error is pending resolution
    ///
    /// Returns `None` when the run is not paused. Cancellation and a dropped
    /// resolver both count as `Abort`.
    pub async fn wait_if_paused(&self) -> Option<ErrorResolution> {
        let waiter = {
            let mut slot = self.pause.lock().await;
            slot.document_index = None;
            slot.waiter.take()?
        };
        debug!(session_id = %self.session_id, "Waiting for error resolution");

        tokio::select! {
            biased;
            resolution = waiter => Some(resolution.unwrap_or(ErrorResolution::Abort)),
            _ = self.cancel.cancelled() => Some(ErrorResolution::Abort),
        }
    }
}
