use axum::extract::ws::Message;
use events::EventPayload;
use orchestrator::Outbound;
use session_core::{ErrorCode, SessionId};

/// Serialize an outbound frame as a text message
pub fn encode(frame: &Outbound) -> Message {
    match serde_json::to_string(frame) {
        Ok(json) => Message::Text(json.into()),
        Err(e) => {
            tracing::error!(kind = frame.kind(), error = %e, "Failed to serialize outbound frame");
            let fallback = Outbound::signal(
                None,
                None,
                EventPayload::error(ErrorCode::Internal, "failed to serialize frame"),
            );
            Message::Text(
                serde_json::to_string(&fallback)
                    .unwrap_or_else(|_| r#"{"type":"error","code":"INTERNAL"}"#.to_string())
                    .into(),
            )
        }
    }
}

/// Connection-scoped liveness signal
pub fn heartbeat(session_id: Option<SessionId>, interval_ms: u64) -> Message {
    encode(&Outbound::signal(
        session_id,
        None,
        EventPayload::Heartbeat { interval_ms },
    ))
}
