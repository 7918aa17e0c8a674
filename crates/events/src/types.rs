//! Server-authored event types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use session_core::{
    ApprovalDecision, CallId, ErrorCode, RunId, RunState, SessionId, TranscriptItem,
};

/// Envelope wrapping every logged event with its ordering metadata
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEnvelope {
    /// Session-scoped, strictly monotonic, gap-free id (first event is 1)
    pub event_id: u64,
    pub session_id: SessionId,
    /// Run the event belongs to, if any
    pub run_id: Option<RunId>,
    /// When the event was appended
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    /// The actual event
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl EventEnvelope {
    pub fn new(
        event_id: u64,
        session_id: SessionId,
        run_id: Option<RunId>,
        payload: EventPayload,
    ) -> Self {
        Self {
            event_id,
            session_id,
            run_id,
            timestamp: Utc::now(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureState {
    Drain,
    Ok,
}

/// All server→client event kinds.
///
/// Heartbeat and backpressure are connection-scoped: they are delivered to a
/// single connection and never enter the log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    // Transcript items
    UserText {
        text: String,
    },
    AssistantText {
        text: String,
    },
    Reasoning {
        text: String,
    },
    ToolCall {
        call_id: CallId,
        name: String,
        args: serde_json::Value,
    },
    FunctionCallOutput {
        call_id: CallId,
        output: serde_json::Value,
        #[serde(default)]
        is_error: bool,
    },

    // Run lifecycle
    /// Full state after a transition
    RunStatus {
        run_state: RunState,
    },
    /// Symmetric completion signal for runs without function output
    TurnDone,

    // Approvals
    ApprovalPending {
        call_id: CallId,
        tool_key: String,
        args: serde_json::Value,
    },
    ApprovalDecision {
        call_id: CallId,
        decision: ApprovalDecision,
    },

    // Signals
    Error {
        code: ErrorCode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
    },
    Heartbeat {
        interval_ms: u64,
    },
    Backpressure {
        state: BackpressureState,
    },
}

impl EventPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UserText { .. } => "user_text",
            Self::AssistantText { .. } => "assistant_text",
            Self::Reasoning { .. } => "reasoning",
            Self::ToolCall { .. } => "tool_call",
            Self::FunctionCallOutput { .. } => "function_call_output",
            Self::RunStatus { .. } => "run_status",
            Self::TurnDone => "turn_done",
            Self::ApprovalPending { .. } => "approval_pending",
            Self::ApprovalDecision { .. } => "approval_decision",
            Self::Error { .. } => "error",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Backpressure { .. } => "backpressure",
        }
    }

    /// Whether this kind belongs in the authoritative log
    pub fn is_loggable(&self) -> bool {
        !matches!(self, Self::Heartbeat { .. } | Self::Backpressure { .. })
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: Some(message.into()),
            details: None,
        }
    }

    pub fn as_transcript(&self) -> Option<TranscriptItem> {
        match self {
            Self::UserText { text } => Some(TranscriptItem::UserText { text: text.clone() }),
            Self::AssistantText { text } => {
                Some(TranscriptItem::AssistantText { text: text.clone() })
            }
            Self::Reasoning { text } => Some(TranscriptItem::Reasoning { text: text.clone() }),
            Self::ToolCall {
                call_id,
                name,
                args,
            } => Some(TranscriptItem::ToolCall {
                call_id: call_id.clone(),
                name: name.clone(),
                args: args.clone(),
            }),
            Self::FunctionCallOutput {
                call_id,
                output,
                is_error,
            } => Some(TranscriptItem::FunctionCallOutput {
                call_id: call_id.clone(),
                output: output.clone(),
                is_error: *is_error,
            }),
            _ => None,
        }
    }

    pub fn run_state(&self) -> Option<&RunState> {
        match self {
            Self::RunStatus { run_state } => Some(run_state),
            _ => None,
        }
    }
}

impl From<TranscriptItem> for EventPayload {
    fn from(item: TranscriptItem) -> Self {
        match item {
            TranscriptItem::UserText { text } => Self::UserText { text },
            TranscriptItem::AssistantText { text } => Self::AssistantText { text },
            TranscriptItem::Reasoning { text } => Self::Reasoning { text },
            TranscriptItem::ToolCall {
                call_id,
                name,
                args,
            } => Self::ToolCall {
                call_id,
                name,
                args,
            },
            TranscriptItem::FunctionCallOutput {
                call_id,
                output,
                is_error,
            } => Self::FunctionCallOutput {
                call_id,
                output,
                is_error,
            },
        }
    }
}
