//! Auto-run API endpoints
//!
//! Start, observe and steer batch runs. Progress itself is pushed over
//! Socket.IO; these endpoints return the current snapshot on demand.

use std::path::PathBuf;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use agent_runner::{BatchRequest, ExecutorError};
use autorun_core::batch::{AgentError, AgentErrorKind, DocumentEntry, ProgressSnapshot};
use autorun_core::history::HistoryEntry;
use git_worktree::WorktreeRequest;

use crate::state::AppState;

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartAutorunRequest {
    #[serde(default)]
    pub session_name: String,
    pub folder_path: PathBuf,
    /// Defaults to the configured repository
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    pub documents: Vec<DocumentEntry>,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub loop_enabled: bool,
    #[serde(default)]
    pub max_loops: Option<u32>,
    #[serde(default)]
    pub worktree: Option<WorktreeRequest>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseRequest {
    pub kind: AgentErrorKind,
    pub message: String,
    #[serde(default)]
    pub originating_agent_id: Option<String>,
    #[serde(default)]
    pub document_index: usize,
    #[serde(default)]
    pub task_description: Option<String>,
}

/// Host went to sleep or came back
#[derive(Debug, Deserialize)]
pub struct SuspendRequest {
    pub suspended: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuspendResponse {
    pub suspended: bool,
    pub affected_runs: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResponse {
    pub session_id: String,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<(StatusCode, Json<T>), ApiError>;

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

fn executor_error(e: ExecutorError) -> ApiError {
    let status = match &e {
        ExecutorError::SessionNotFound { .. } => StatusCode::NOT_FOUND,
        ExecutorError::SessionExists { .. }
        | ExecutorError::NotPaused { .. }
        | ExecutorError::NotRunning { .. } => StatusCode::CONFLICT,
        ExecutorError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, e.to_string())
}

fn accepted(session_id: String, status: &str) -> ApiResult<ActionResponse> {
    Ok((
        StatusCode::ACCEPTED,
        Json(ActionResponse {
            session_id,
            status: status.to_string(),
        }),
    ))
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/sessions/{id}/autorun
async fn start_autorun(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<StartAutorunRequest>,
) -> ApiResult<ActionResponse> {
    if body.documents.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "At least one document is required"));
    }

    let request = BatchRequest {
        session_id: session_id.clone(),
        session_name: body.session_name,
        folder_path: body.folder_path,
        cwd: body.cwd.unwrap_or_else(|| state.repo_path().to_path_buf()),
        documents: body.documents,
        prompt: body.prompt,
        loop_enabled: body.loop_enabled,
        max_loops: body.max_loops,
        worktree: body.worktree,
    };

    // The run is detached; its end is visible through progress and history
    let _handle = state
        .executor()
        .start(request)
        .await
        .map_err(executor_error)?;

    info!("Auto-run started for session {}", session_id);
    accepted(session_id, "started")
}

/// GET /api/sessions/{id}/autorun
async fn get_autorun(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<ProgressSnapshot>, ApiError> {
    state
        .executor()
        .snapshot(&session_id)
        .await
        .map(Json)
        .ok_or_else(|| {
            api_error(
                StatusCode::NOT_FOUND,
                format!("No auto-run for session {}", session_id),
            )
        })
}

/// GET /api/autorun
async fn list_autoruns(State(state): State<AppState>) -> Json<Vec<ProgressSnapshot>> {
    Json(state.executor().list().await)
}

/// POST /api/autorun/suspend
///
/// Elapsed time of every run stops counting while the host is suspended.
async fn suspend_autoruns(
    State(state): State<AppState>,
    Json(body): Json<SuspendRequest>,
) -> Json<SuspendResponse> {
    let affected_runs = state.executor().set_suspended(body.suspended).await;
    Json(SuspendResponse {
        suspended: body.suspended,
        affected_runs,
    })
}

/// POST /api/sessions/{id}/autorun/stop
async fn stop_autorun(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<ActionResponse> {
    state
        .executor()
        .request_stop(&session_id)
        .await
        .map_err(executor_error)?;
    accepted(session_id, "stopping")
}

/// POST /api/sessions/{id}/autorun/pause
async fn pause_autorun(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<PauseRequest>,
) -> ApiResult<ActionResponse> {
    let error = AgentError::new(
        body.kind,
        body.message,
        body.originating_agent_id.unwrap_or_else(|| "operator".to_string()),
    );
    state
        .executor()
        .pause_on_error(&session_id, error, body.document_index, body.task_description)
        .await
        .map_err(executor_error)?;
    accepted(session_id, "paused")
}

/// POST /api/sessions/{id}/autorun/resume
async fn resume_autorun(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<ActionResponse> {
    state
        .executor()
        .resume_after_error(&session_id)
        .await
        .map_err(executor_error)?;
    accepted(session_id, "resumed")
}

/// POST /api/sessions/{id}/autorun/skip
async fn skip_document(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<ActionResponse> {
    state
        .executor()
        .skip_current_document(&session_id)
        .await
        .map_err(executor_error)?;
    accepted(session_id, "skipping")
}

/// POST /api/sessions/{id}/autorun/abort
async fn abort_autorun(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<ActionResponse> {
    state
        .executor()
        .abort_on_error(&session_id)
        .await
        .map_err(executor_error)?;
    accepted(session_id, "aborting")
}

/// GET /api/sessions/{id}/autorun/history
async fn get_history(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<HistoryEntry>>, ApiError> {
    match state.history().list(&session_id).await {
        Ok(entries) => Ok(Json(entries)),
        Err(autorun_core::Error::InvalidInput(message)) => {
            Err(api_error(StatusCode::BAD_REQUEST, message))
        }
        Err(e) => {
            warn!("Failed to read history for {}: {}", session_id, e);
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/autorun", get(list_autoruns))
        .route("/api/autorun/suspend", post(suspend_autoruns))
        .route(
            "/api/sessions/{id}/autorun",
            get(get_autorun).post(start_autorun),
        )
        .route("/api/sessions/{id}/autorun/stop", post(stop_autorun))
        .route("/api/sessions/{id}/autorun/pause", post(pause_autorun))
        .route("/api/sessions/{id}/autorun/resume", post(resume_autorun))
        .route("/api/sessions/{id}/autorun/skip", post(skip_document))
        .route("/api/sessions/{id}/autorun/abort", post(abort_autorun))
        .route("/api/sessions/{id}/autorun/history", get(get_history))
}
