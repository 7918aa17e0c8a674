//! Client command set and wire error codes.

use serde::{Deserialize, Serialize};
use serde_json::error::Category;
use utoipa::ToSchema;

use crate::domain::{CallId, RunId, SessionId};
use crate::error::CoreError;

/// Semantic protocol version reported on `welcome` and `snapshot`.
pub const PROTOCOL_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidCommand,
    MissingField,
    BadArgument,
    StaleRunId,
    NotRunning,
    Busy,
    UnknownCallId,
    ApprovalConflict,
    AgentError,
    Internal,
    ReplayWindowExceeded,
    SessionNotFound,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidCommand => "INVALID_COMMAND",
            Self::MissingField => "MISSING_FIELD",
            Self::BadArgument => "BAD_ARGUMENT",
            Self::StaleRunId => "STALE_RUN_ID",
            Self::NotRunning => "NOT_RUNNING",
            Self::Busy => "BUSY",
            Self::UnknownCallId => "UNKNOWN_CALL_ID",
            Self::ApprovalConflict => "APPROVAL_CONFLICT",
            Self::AgentError => "AGENT_ERROR",
            Self::Internal => "INTERNAL",
            Self::ReplayWindowExceeded => "REPLAY_WINDOW_EXCEEDED",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Commands a client may send, keyed by `type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    Hello,
    Resume {
        last_seen_event_id: u64,
    },
    Send {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_msg_id: Option<String>,
    },
    Approve {
        call_id: CallId,
    },
    Deny {
        call_id: CallId,
        /// Abort the whole run instead of continuing without the call.
        #[serde(default)]
        abort: bool,
    },
    Abort {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        run_id: Option<RunId>,
    },
    GetSnapshot,
    Ping,
}

impl ClientCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Hello => "hello",
            Self::Resume { .. } => "resume",
            Self::Send { .. } => "send",
            Self::Approve { .. } => "approve",
            Self::Deny { .. } => "deny",
            Self::Abort { .. } => "abort",
            Self::GetSnapshot => "get_snapshot",
            Self::Ping => "ping",
        }
    }
}

/// A parsed client message: routing metadata plus the command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientFrame {
    /// Client correlation id, echoed on direct replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub req_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,

    #[serde(flatten)]
    pub command: ClientCommand,
}

impl ClientFrame {
    pub fn new(command: ClientCommand) -> Self {
        Self {
            req_id: None,
            session_id: None,
            command,
        }
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Parse and validate one text frame.
    pub fn parse(text: &str) -> Result<Self, CoreError> {
        let frame: ClientFrame = serde_json::from_str(text).map_err(classify_json_error)?;
        frame.validate()?;
        Ok(frame)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        match &self.command {
            ClientCommand::Resume { .. } if self.session_id.is_none() => {
                Err(CoreError::MissingField("session_id".to_string()))
            }
            ClientCommand::Send {
                text,
                client_msg_id,
            } => {
                if text.trim().is_empty() {
                    return Err(CoreError::BadArgument("text must not be empty".to_string()));
                }
                if client_msg_id.as_deref().is_some_and(str::is_empty) {
                    return Err(CoreError::BadArgument(
                        "client_msg_id must not be empty".to_string(),
                    ));
                }
                Ok(())
            }
            ClientCommand::Approve { call_id } | ClientCommand::Deny { call_id, .. }
                if call_id.as_str().is_empty() =>
            {
                Err(CoreError::BadArgument("call_id must not be empty".to_string()))
            }
            _ => Ok(()),
        }
    }
}

fn classify_json_error(error: serde_json::Error) -> CoreError {
    match error.classify() {
        Category::Syntax | Category::Eof | Category::Io => {
            CoreError::InvalidCommand(format!("invalid JSON: {}", error))
        }
        Category::Data => {
            let message = error.to_string();
            if message.starts_with("missing field") {
                let field = backticked(&message).unwrap_or("unknown");
                if field == "type" {
                    CoreError::InvalidCommand("missing command type".to_string())
                } else {
                    CoreError::MissingField(field.to_string())
                }
            } else if message.starts_with("unknown variant") {
                let name = backticked(&message).unwrap_or("unknown");
                CoreError::InvalidCommand(format!("unknown command: {}", name))
            } else {
                CoreError::BadArgument(message)
            }
        }
    }
}

fn backticked(message: &str) -> Option<&str> {
    let start = message.find('`')? + 1;
    let len = message[start..].find('`')?;
    Some(&message[start..start + len])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_send_without_token() {
        let frame = ClientFrame::parse(r#"{"type":"send","text":"hi"}"#).unwrap();
        assert_eq!(
            frame.command,
            ClientCommand::Send {
                text: "hi".to_string(),
                client_msg_id: None
            }
        );
        assert!(frame.req_id.is_none());
    }

    #[test]
    fn test_parse_keeps_routing_fields() {
        let frame = ClientFrame::parse(
            r#"{"type":"resume","session_id":"s1","req_id":"r9","last_seen_event_id":4}"#,
        )
        .unwrap();
        assert_eq!(frame.session_id, Some(SessionId::new("s1")));
        assert_eq!(frame.req_id.as_deref(), Some("r9"));
        assert_eq!(
            frame.command,
            ClientCommand::Resume {
                last_seen_event_id: 4
            }
        );
    }

    #[test]
    fn test_deny_defaults_to_continue() {
        let frame = ClientFrame::parse(r#"{"type":"deny","call_id":"c1"}"#).unwrap();
        assert_eq!(
            frame.command,
            ClientCommand::Deny {
                call_id: CallId::new("c1"),
                abort: false
            }
        );
    }

    #[test]
    fn test_abort_run_id_is_optional() {
        let frame = ClientFrame::parse(r#"{"type":"abort"}"#).unwrap();
        assert_eq!(frame.command, ClientCommand::Abort { run_id: None });

        let frame = ClientFrame::parse(r#"{"type":"abort","run_id":2}"#).unwrap();
        assert_eq!(
            frame.command,
            ClientCommand::Abort {
                run_id: Some(RunId(2))
            }
        );
    }

    #[test]
    fn test_unknown_type_is_invalid_command() {
        let err = ClientFrame::parse(r#"{"type":"dance"}"#).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidCommand);
    }

    #[test]
    fn test_garbage_is_invalid_command() {
        let err = ClientFrame::parse("{not json").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidCommand);
    }

    #[test]
    fn test_missing_text_is_missing_field() {
        let err = ClientFrame::parse(r#"{"type":"send"}"#).unwrap_err();
        assert_eq!(err, CoreError::MissingField("text".to_string()));
    }

    #[test]
    fn test_wrong_type_is_bad_argument() {
        let err = ClientFrame::parse(r#"{"type":"resume","session_id":"s","last_seen_event_id":"x"}"#)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadArgument);
    }

    #[test]
    fn test_empty_text_is_bad_argument() {
        let err = ClientFrame::parse(r#"{"type":"send","text":"   "}"#).unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadArgument);
    }

    #[test]
    fn test_resume_requires_session() {
        let err = ClientFrame::parse(r#"{"type":"resume","last_seen_event_id":1}"#).unwrap_err();
        assert_eq!(err, CoreError::MissingField("session_id".to_string()));
    }

    #[test]
    fn test_error_code_wire_names() {
        assert_eq!(
            serde_json::to_string(&ErrorCode::ApprovalConflict).unwrap(),
            r#""APPROVAL_CONFLICT""#
        );
        assert_eq!(ErrorCode::StaleRunId.as_str(), "STALE_RUN_ID");
    }
}
