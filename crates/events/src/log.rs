//! The append-only event log contract

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use session_core::{RunId, SessionId};
use thiserror::Error;

use crate::snapshot::SessionSnapshot;
use crate::types::{EventEnvelope, EventPayload};

/// Lazy, finite sequence of replayed events
pub type ReplayStream = BoxStream<'static, std::result::Result<EventEnvelope, LogError>>;

#[derive(Error, Debug)]
pub enum LogError {
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    /// The caller must fall back to a full snapshot
    #[error("Replay from {requested} exceeds retained window (oldest retained: {oldest_retained})")]
    WindowExceeded {
        requested: u64,
        oldest_retained: u64,
    },

    #[error("Replay from {requested} is ahead of the log (last event: {last})")]
    AheadOfLog { requested: u64, last: u64 },

    #[error("Event kind is connection-scoped and cannot be logged: {0}")]
    NotLoggable(&'static str),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LogError {
    /// Replay cannot be served; the client needs a snapshot instead
    pub fn requires_snapshot(&self) -> bool {
        matches!(self, Self::WindowExceeded { .. } | Self::AheadOfLog { .. })
    }

    /// Errors that mean the log itself is broken, as opposed to a bad request
    pub fn is_storage_failure(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Serialization(_))
    }
}

pub type Result<T> = std::result::Result<T, LogError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Events retained per session for replay
    pub retention_window: usize,
    /// Transcript items kept in the snapshot
    pub transcript_window: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            retention_window: 1000,
            transcript_window: 200,
        }
    }
}

/// Session attributes fixed at creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMeta {
    pub version: String,
    pub capabilities: Vec<String>,
}

/// Validate a replay request against the retained range.
///
/// `oldest_retained` is `last + 1` when nothing is retained.
pub fn check_replay_range(requested: u64, oldest_retained: u64, last: u64) -> Result<()> {
    if requested > last {
        return Err(LogError::AheadOfLog { requested, last });
    }
    if requested.saturating_add(1) < oldest_retained {
        return Err(LogError::WindowExceeded {
            requested,
            oldest_retained,
        });
    }
    Ok(())
}

/// Per-session append-only sequence of server-authored events.
///
/// Implementations assign gap-free, strictly increasing `event_id`s starting
/// at 1, and every append is visible to the next `replay` or `snapshot` call.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Open a session, creating it if absent. Returns its current snapshot.
    async fn open(&self, session_id: &SessionId, meta: SessionMeta) -> Result<SessionSnapshot>;

    /// Record one event and return it with its assigned id.
    async fn append(
        &self,
        session_id: &SessionId,
        run_id: Option<RunId>,
        payload: EventPayload,
    ) -> Result<EventEnvelope>;

    /// All retained events with id greater than `from_event_id`.
    async fn replay(&self, session_id: &SessionId, from_event_id: u64) -> Result<ReplayStream>;

    async fn snapshot(&self, session_id: &SessionId) -> Result<SessionSnapshot>;

    /// Purge a session. Returns whether it existed.
    async fn remove(&self, session_id: &SessionId) -> Result<bool>;

    async fn list_sessions(&self) -> Result<Vec<SessionId>>;
}
