use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// A human decision on a pending tool call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    /// Refuse this call and let the run continue.
    DenyContinue,
    /// Refuse this call and abort the run.
    DenyAbort,
}

impl ApprovalDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::DenyContinue => "deny_continue",
            Self::DenyAbort => "deny_abort",
        }
    }

    pub fn is_approval(&self) -> bool {
        matches!(self, Self::Approve)
    }
}

/// Outcome of evaluating the approval policy for a tool call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PolicyDecision {
    Allow,
    #[default]
    Ask,
    DenyContinue,
    DenyAbort,
}

impl PolicyDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Ask => "ask",
            Self::DenyContinue => "deny_continue",
            Self::DenyAbort => "deny_abort",
        }
    }
}
