use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::ids::{CallId, RunId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Idle,
    Starting,
    Running,
    AwaitingApproval,
    Aborting,
    Finished,
    Error,
    Aborted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Aborting => "aborting",
            Self::Finished => "finished",
            Self::Error => "error",
            Self::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(Self::Idle),
            "starting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "awaiting_approval" => Some(Self::AwaitingApproval),
            "aborting" => Some(Self::Aborting),
            "finished" => Some(Self::Finished),
            "error" => Some(Self::Error),
            "aborted" => Some(Self::Aborted),
            _ => None,
        }
    }

    /// Statuses that count as "the session's active run".
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Starting | Self::Running | Self::AwaitingApproval | Self::Aborting
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Error | Self::Aborted)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tool call waiting for a human decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct ApprovalBrief {
    pub call_id: CallId,
    pub tool_key: String,
    #[schema(value_type = Object)]
    pub args: serde_json::Value,
}

/// Full state of one run. Every `run_status` event carries a complete copy,
/// never a delta.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct RunState {
    pub run_id: RunId,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pending_approvals: Vec<ApprovalBrief>,
    /// Failure description, set only when `status` is `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunState {
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            status: RunStatus::Starting,
            started_at: Utc::now(),
            finished_at: None,
            pending_approvals: Vec::new(),
            error: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn finish(&mut self, status: RunStatus, error: Option<String>) {
        self.status = status;
        self.finished_at = Some(Utc::now());
        self.pending_approvals.clear();
        self.error = error;
    }
}
