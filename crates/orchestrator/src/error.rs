use events::LogError;
use session_core::{CallId, CoreError, ErrorCode, RunId, RunStatus, SessionId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Command(#[from] CoreError),

    #[error("A run is already active: {active}")]
    Busy { active: RunId },

    #[error("No run is active")]
    NotRunning,

    #[error("Run {requested} is not the active run")]
    StaleRunId {
        requested: RunId,
        active: Option<RunId>,
    },

    #[error("No pending approval for call: {0}")]
    UnknownCallId(CallId),

    #[error("Call already pending, decided or executing: {0}")]
    ApprovalConflict(CallId),

    #[error("Invalid run transition from {from} to {to}")]
    InvalidTransition { from: RunStatus, to: RunStatus },

    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Session is unavailable after a storage failure: {0}")]
    SessionFailed(String),

    #[error("Event log error: {0}")]
    Log(#[from] LogError),
}

impl OrchestratorError {
    /// Wire code reported in `error` frames
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Command(e) => e.code(),
            Self::Busy { .. } => ErrorCode::Busy,
            Self::NotRunning => ErrorCode::NotRunning,
            Self::StaleRunId { .. } => ErrorCode::StaleRunId,
            Self::UnknownCallId(_) => ErrorCode::UnknownCallId,
            Self::ApprovalConflict(_) => ErrorCode::ApprovalConflict,
            Self::SessionNotFound(_) => ErrorCode::SessionNotFound,
            Self::InvalidTransition { .. } | Self::SessionFailed(_) => ErrorCode::Internal,
            Self::Log(e) if e.requires_snapshot() => ErrorCode::ReplayWindowExceeded,
            Self::Log(LogError::SessionNotFound(_)) => ErrorCode::SessionNotFound,
            Self::Log(_) => ErrorCode::Internal,
        }
    }

    /// Structured context for the `details` field of an error frame
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::Busy { active } => Some(serde_json::json!({ "active_run_id": active })),
            Self::StaleRunId { requested, active } => Some(serde_json::json!({
                "run_id": requested,
                "active_run_id": active,
            })),
            Self::Log(LogError::WindowExceeded {
                oldest_retained, ..
            }) => Some(serde_json::json!({
                "action": "get_snapshot",
                "oldest_event_id": oldest_retained,
            })),
            Self::Log(LogError::AheadOfLog { last, .. }) => Some(serde_json::json!({
                "action": "get_snapshot",
                "last_event_id": last,
            })),
            _ => None,
        }
    }

    /// Client-input and lifecycle-conflict errors leave state untouched.
    pub fn is_rejection(&self) -> bool {
        !matches!(self.code(), ErrorCode::Internal)
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
