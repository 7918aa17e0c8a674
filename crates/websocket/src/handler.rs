use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use orchestrator::SessionRegistry;
use serde::Deserialize;
use session_core::{ClientCommand, ClientFrame, SessionId};
use tokio::time::{interval, Instant};

use crate::messages::{encode, heartbeat};

/// A client that sends nothing for this many heartbeat intervals is dropped
const MISSED_HEARTBEATS: u32 = 2;

#[derive(Clone)]
pub struct WsState {
    pub registry: Arc<SessionRegistry>,
    pub heartbeat_interval: Duration,
}

impl WsState {
    pub fn new(registry: Arc<SessionRegistry>, heartbeat_interval: Duration) -> Self {
        Self {
            registry,
            heartbeat_interval,
        }
    }
}

/// `?session_id=` attaches the socket to that session on upgrade, as if the
/// client had sent `hello` for it.
#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    pub session_id: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<WsState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let session_id = query.session_id.filter(|id| !id.is_empty()).map(SessionId::new);
    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id))
}

async fn handle_socket(socket: WebSocket, state: Arc<WsState>, session_id: Option<SessionId>) {
    let (mut sender, mut receiver) = socket.split();
    let (conn, mut outbound) = state.registry.connect();
    tracing::debug!(connection_id = %conn.id(), "WebSocket connected");

    if let Some(session_id) = session_id {
        let hello = ClientFrame::new(ClientCommand::Hello).with_session(session_id);
        state.registry.handle(&conn, hello).await;
    }

    let interval_ms = u64::try_from(state.heartbeat_interval.as_millis()).unwrap_or(u64::MAX);
    let silence_limit = state.heartbeat_interval * MISSED_HEARTBEATS;
    let mut last_seen = Instant::now();

    let mut ticker = interval(state.heartbeat_interval);
    ticker.reset();

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                match frame {
                    Some(frame) => {
                        if sender.send(encode(&frame)).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        tracing::debug!(connection_id = %conn.id(), "Connection closed by server");
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                }
            }

            _ = ticker.tick() => {
                if last_seen.elapsed() >= silence_limit {
                    tracing::debug!(connection_id = %conn.id(), "WebSocket client silent, closing");
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
                if sender.send(heartbeat(conn.session_id(), interval_ms)).await.is_err() {
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                last_seen = Instant::now();
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        state.registry.handle_text(&conn, text.as_str()).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(connection_id = %conn.id(), error = %e, "WebSocket read error");
                        break;
                    }
                }
            }
        }
    }

    state.registry.disconnect(&conn);
    tracing::debug!(connection_id = %conn.id(), "WebSocket connection closed");
}
