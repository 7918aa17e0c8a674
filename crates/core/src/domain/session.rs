use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::ids::{RunId, SessionId};

/// Session-level state as reported in `welcome` and `snapshot`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct SessionState {
    pub session_id: SessionId,
    pub version: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Number of runs ever created in this session; the source of new run ids.
    pub run_counter: u64,
    pub last_event_id: Option<u64>,
    pub active_run_id: Option<RunId>,
}

impl SessionState {
    pub fn new(session_id: SessionId, version: impl Into<String>, capabilities: Vec<String>) -> Self {
        Self {
            session_id,
            version: version.into(),
            capabilities,
            run_counter: 0,
            last_event_id: None,
            active_run_id: None,
        }
    }
}
