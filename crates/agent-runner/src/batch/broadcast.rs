//! Debounced progress broadcasting
//!
//! Snapshots are coalesced per session and pushed after a fixed delay.
//! Transitions an observer must not miss (run start and end, error raised or
//! cleared, stop requested) are pushed right away and replace whatever was
//! pending for that session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use autorun_core::batch::{ProgressSnapshot, StoreObserver};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

/// Destination of progress snapshots; `None` means the session has no run
pub trait BroadcastSink: Send + Sync {
    fn push(&self, session_id: &str, snapshot: Option<&ProgressSnapshot>);
}

/// Sink that drops everything
#[derive(Debug, Default)]
pub struct NullBroadcastSink;

impl BroadcastSink for NullBroadcastSink {
    fn push(&self, _session_id: &str, _snapshot: Option<&ProgressSnapshot>) {}
}

enum Command {
    Publish {
        key: String,
        payload: Option<ProgressSnapshot>,
        immediate: bool,
    },
    Shutdown(oneshot::Sender<()>),
}

struct Pending {
    payload: Option<ProgressSnapshot>,
    deadline: Instant,
}

/// Background task coalescing snapshots per session
pub struct BroadcastDebouncer {
    tx: mpsc::UnboundedSender<Command>,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl BroadcastDebouncer {
    /// Spawn the debouncer task; must be called inside a tokio runtime
    pub fn spawn(sink: Arc<dyn BroadcastSink>, delay: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(sink, delay, rx));
        Self {
            tx,
            handle: std::sync::Mutex::new(Some(handle)),
        }
    }

    /// Queue a snapshot for a session
    pub fn publish(&self, key: &str, payload: Option<ProgressSnapshot>, immediate: bool) {
        let command = Command::Publish {
            key: key.to_string(),
            payload,
            immediate,
        };
        if self.tx.send(command).is_err() {
            debug!(session_id = key, "Broadcast debouncer already shut down");
        }
    }

    /// Flush everything pending and stop the task
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Broadcast debouncer task failed: {}", e);
            }
        }
    }
}

/// Whether a change must reach observers without delay
pub fn is_significant(previous: Option<&ProgressSnapshot>, current: Option<&ProgressSnapshot>) -> bool {
    match (previous, current) {
        (Some(prev), Some(cur)) => {
            prev.is_running != cur.is_running
                || prev.error.is_some() != cur.error.is_some()
                || prev.is_stopping != cur.is_stopping
        }
        _ => true,
    }
}

impl StoreObserver for BroadcastDebouncer {
    fn on_change(
        &self,
        session_id: &str,
        previous: Option<&ProgressSnapshot>,
        current: Option<&ProgressSnapshot>,
    ) {
        self.publish(session_id, current.cloned(), is_significant(previous, current));
    }
}

async fn run(
    sink: Arc<dyn BroadcastSink>,
    delay: Duration,
    mut rx: mpsc::UnboundedReceiver<Command>,
) {
    let mut pending: HashMap<String, Pending> = HashMap::new();

    loop {
        let next_deadline = pending.values().map(|p| p.deadline).min();
        let command = match next_deadline {
            Some(deadline) => tokio::select! {
                command = rx.recv() => command,
                _ = sleep_until(deadline) => {
                    flush_due(sink.as_ref(), &mut pending, Instant::now());
                    continue;
                }
            },
            None => rx.recv().await,
        };

        match command {
            Some(Command::Publish {
                key,
                payload,
                immediate,
            }) => {
                if immediate {
                    pending.remove(&key);
                    sink.push(&key, payload.as_ref());
                } else {
                    let deadline = Instant::now() + delay;
                    pending
                        .entry(key)
                        .and_modify(|p| p.payload = payload.clone())
                        .or_insert(Pending { payload, deadline });
                }
            }
            Some(Command::Shutdown(done)) => {
                flush_all(sink.as_ref(), &mut pending);
                let _ = done.send(());
                break;
            }
            None => {
                flush_all(sink.as_ref(), &mut pending);
                break;
            }
        }
    }
}

fn flush_due(sink: &dyn BroadcastSink, pending: &mut HashMap<String, Pending>, now: Instant) {
    let due: Vec<String> = pending
        .iter()
        .filter(|(_, p)| p.deadline <= now)
        .map(|(key, _)| key.clone())
        .collect();
    for key in due {
        if let Some(p) = pending.remove(&key) {
            sink.push(&key, p.payload.as_ref());
        }
    }
}

fn flush_all(sink: &dyn BroadcastSink, pending: &mut HashMap<String, Pending>) {
    for (key, p) in pending.drain() {
        sink.push(&key, p.payload.as_ref());
    }
}
