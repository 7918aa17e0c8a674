use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::ids::CallId;

/// One item of a run's transcript.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TranscriptItem {
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
        #[schema(value_type = Object)]
        args: serde_json::Value,
    },
    FunctionCallOutput {
        call_id: CallId,
        #[schema(value_type = Object)]
        output: serde_json::Value,
        #[serde(default)]
        is_error: bool,
    },
}

impl TranscriptItem {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UserText { .. } => "user_text",
            Self::AssistantText { .. } => "assistant_text",
            Self::Reasoning { .. } => "reasoning",
            Self::ToolCall { .. } => "tool_call",
            Self::FunctionCallOutput { .. } => "function_call_output",
        }
    }

    pub fn call_id(&self) -> Option<&CallId> {
        match self {
            Self::ToolCall { call_id, .. } | Self::FunctionCallOutput { call_id, .. } => {
                Some(call_id)
            }
            _ => None,
        }
    }
}
