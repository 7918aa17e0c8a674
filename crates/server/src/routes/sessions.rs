use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use events::{LogError, SessionSnapshot};
use orchestrator::SessionSummary;
use serde::{Deserialize, Serialize};
use session_core::{RunState, SessionId, SessionState, TranscriptItem};
use utoipa::ToSchema;

use crate::error::AppError;
use crate::state::AppState;

const MAX_SESSION_ID_LEN: usize = 128;

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct CreateSessionRequest {
    /// Generated when omitted
    pub session_id: Option<String>,
}

/// Point-in-time view of a session, the same shape a `snapshot` frame carries
#[derive(Debug, Serialize, ToSchema)]
pub struct SnapshotResponse {
    pub v: String,
    pub session_state: SessionState,
    pub run_state: Option<RunState>,
    pub transcript: Vec<TranscriptItem>,
    pub as_of_event_id: u64,
}

impl SnapshotResponse {
    fn new(v: String, snapshot: SessionSnapshot) -> Self {
        Self {
            v,
            session_state: snapshot.session_state,
            run_state: snapshot.run_state,
            transcript: snapshot.transcript,
            as_of_event_id: snapshot.as_of_event_id,
        }
    }
}

#[utoipa::path(
    get,
    path = "/api/sessions",
    responses(
        (status = 200, description = "List of all sessions", body = Vec<SessionSummary>)
    ),
    tag = "sessions"
)]
pub async fn list_sessions(
    State(state): State<AppState>,
) -> Result<Json<Vec<SessionSummary>>, AppError> {
    let sessions = state.registry.list().await?;
    Ok(Json(sessions))
}

#[utoipa::path(
    post,
    path = "/api/sessions",
    request_body = CreateSessionRequest,
    responses(
        (status = 201, description = "Session created", body = SessionState),
        (status = 400, description = "Invalid session id"),
        (status = 409, description = "Session already exists")
    ),
    tag = "sessions"
)]
pub async fn create_session(
    State(state): State<AppState>,
    Json(payload): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionState>), AppError> {
    let session_id = match payload.session_id {
        Some(id) => {
            let id = id.trim();
            if id.is_empty() || id.len() > MAX_SESSION_ID_LEN {
                return Err(AppError::BadRequest(format!(
                    "session_id must be 1 to {} characters",
                    MAX_SESSION_ID_LEN
                )));
            }
            let id = SessionId::new(id);
            match state.registry.log().snapshot(&id).await {
                Ok(_) => {
                    return Err(AppError::Conflict(format!("Session already exists: {}", id)))
                }
                Err(LogError::SessionNotFound(_)) => {}
                Err(e) => return Err(AppError::Internal(e.to_string())),
            }
            Some(id)
        }
        None => None,
    };

    let session = state.registry.create(session_id).await?;
    let snapshot = session.snapshot().await?;
    tracing::info!(session_id = %session.id(), "Session created via API");

    Ok((StatusCode::CREATED, Json(snapshot.session_state)))
}

#[utoipa::path(
    get,
    path = "/api/sessions/{id}/snapshot",
    params(
        ("id" = String, Path, description = "Session ID")
    ),
    responses(
        (status = 200, description = "Session snapshot", body = SnapshotResponse),
        (status = 404, description = "Session not found")
    ),
    tag = "sessions"
)]
pub async fn get_session_snapshot(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SnapshotResponse>, AppError> {
    let snapshot = state.registry.snapshot(&SessionId::new(id)).await?;
    let v = state.registry.config().protocol_version.clone();
    Ok(Json(SnapshotResponse::new(v, snapshot)))
}

#[utoipa::path(
    get,
    path = "/api/sessions/{id}/runs",
    params(
        ("id" = String, Path, description = "Session ID")
    ),
    responses(
        (status = 200, description = "Active run followed by retained terminal runs", body = Vec<RunState>),
        (status = 404, description = "Session not found")
    ),
    tag = "sessions"
)]
pub async fn list_session_runs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<RunState>>, AppError> {
    let runs = state.registry.runs(&SessionId::new(id)).await?;
    Ok(Json(runs))
}

#[utoipa::path(
    delete,
    path = "/api/sessions/{id}",
    params(
        ("id" = String, Path, description = "Session ID")
    ),
    responses(
        (status = 204, description = "Session deleted"),
        (status = 404, description = "Session not found")
    ),
    tag = "sessions"
)]
pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let id = SessionId::new(id);
    let deleted = state.registry.destroy(&id).await?;

    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("Session not found: {}", id)))
    }
}
