use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::response::IntoResponse;

use websocket::WsQuery;

use crate::state::AppState;

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    query: Query<WsQuery>,
) -> impl IntoResponse {
    websocket::ws_handler(ws, State(state.ws.clone()), query).await
}
