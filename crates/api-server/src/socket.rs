//! Socket.IO event handlers for live batch progress
//!
//! Progress is pushed to every client as `autorun:progress`. A client that
//! connects late asks for the current picture with `autorun:request-sync`.

use std::sync::{Arc, OnceLock};

use agent_runner::{BatchExecutor, BroadcastSink};
use autorun_core::batch::ProgressSnapshot;
use serde::{Deserialize, Serialize};
use socketioxide::extract::{Data, SocketRef, State};
use socketioxide::{SocketIo, TransportType};
use tracing::{debug, info, warn};

pub const PROGRESS_EVENT: &str = "autorun:progress";
pub const SYNC_EVENT: &str = "autorun:sync";
pub const ERROR_EVENT: &str = "autorun:error";

/// Shared state for Socket.IO handlers
#[derive(Clone)]
pub struct SocketState {
    pub executor: Arc<BatchExecutor>,
}

// ============ Event Payloads ============

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressPayload {
    pub session_id: String,
    /// `null` once the session no longer has a run
    pub snapshot: Option<ProgressSnapshot>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPayload {
    pub runs: Vec<ProgressSnapshot>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPayload {
    pub session_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub session_id: String,
    pub message: String,
}

// ============ Broadcast Sink ============

/// Emits debounced snapshots to every connected client
///
/// The sink exists before the Socket.IO layer does, so the handle is attached
/// once the layer is built. Pushes before that are dropped.
#[derive(Clone, Default)]
pub struct SocketBroadcastSink {
    io: Arc<OnceLock<SocketIo>>,
}

impl SocketBroadcastSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, io: SocketIo) {
        if self.io.set(io).is_err() {
            warn!("Socket.IO instance already attached to broadcast sink");
        }
    }
}

impl BroadcastSink for SocketBroadcastSink {
    fn push(&self, session_id: &str, snapshot: Option<&ProgressSnapshot>) {
        let Some(io) = self.io.get() else {
            debug!(session_id, "Dropping progress push, Socket.IO not attached");
            return;
        };
        let payload = ProgressPayload {
            session_id: session_id.to_string(),
            snapshot: snapshot.cloned(),
        };
        if let Err(e) = io.emit(PROGRESS_EVENT, &payload) {
            warn!("Failed to emit progress for {}: {}", session_id, e);
        }
    }
}

// ============ Event Handlers ============

/// Handle new socket connection
pub async fn on_connect(socket: SocketRef) {
    info!("Client connected: {}", socket.id);

    socket.on(
        "autorun:request-sync",
        |socket: SocketRef, State(state): State<SocketState>| async move {
            handle_request_sync(socket, state).await;
        },
    );

    socket.on(
        "autorun:stop",
        |socket: SocketRef, State(state): State<SocketState>, Data(data): Data<SessionPayload>| async move {
            let result = state.executor.request_stop(&data.session_id).await;
            report(&socket, data.session_id, result);
        },
    );

    socket.on(
        "autorun:resume",
        |socket: SocketRef, State(state): State<SocketState>, Data(data): Data<SessionPayload>| async move {
            let result = state.executor.resume_after_error(&data.session_id).await;
            report(&socket, data.session_id, result);
        },
    );

    socket.on(
        "autorun:skip",
        |socket: SocketRef, State(state): State<SocketState>, Data(data): Data<SessionPayload>| async move {
            let result = state.executor.skip_current_document(&data.session_id).await;
            report(&socket, data.session_id, result);
        },
    );

    socket.on(
        "autorun:abort",
        |socket: SocketRef, State(state): State<SocketState>, Data(data): Data<SessionPayload>| async move {
            let result = state.executor.abort_on_error(&data.session_id).await;
            report(&socket, data.session_id, result);
        },
    );

    socket.on_disconnect(|socket: SocketRef| async move {
        info!("Client disconnected: {}", socket.id);
    });
}

async fn handle_request_sync(socket: SocketRef, state: SocketState) {
    info!("Client {} requested sync", socket.id);
    let payload = SyncPayload {
        runs: state.executor.list().await,
    };
    if let Err(e) = socket.emit(SYNC_EVENT, &payload) {
        warn!("Failed to emit sync: {}", e);
    }
}

/// Progress reaches clients through the sink; only failures are answered here
fn report(socket: &SocketRef, session_id: String, result: agent_runner::Result<()>) {
    if let Err(e) = result {
        warn!("Socket request for {} failed: {}", session_id, e);
        let _ = socket.emit(
            ERROR_EVENT,
            &ErrorPayload {
                session_id,
                message: e.to_string(),
            },
        );
    }
}

/// Create and configure Socket.IO layer
pub fn create_socket_layer(
    state: SocketState,
    allow_polling: bool,
) -> (socketioxide::layer::SocketIoLayer, SocketIo) {
    let builder = SocketIo::builder().with_state(state);
    let (layer, io) = if allow_polling {
        builder.build_layer()
    } else {
        // WebSocket only avoids CORS issues with polling
        builder.transports([TransportType::Websocket]).build_layer()
    };

    io.ns("/", on_connect);

    (layer, io)
}
