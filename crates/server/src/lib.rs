pub mod config;
pub mod error;
pub mod routes;
pub mod state;

use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use state::AppState;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Agent Session API",
        version = "0.1.0",
        description = "Inspection and lifecycle endpoints for server-authoritative agent sessions. Live interaction happens over the /ws protocol."
    ),
    paths(
        routes::health_check,
        routes::list_sessions,
        routes::create_session,
        routes::get_session_snapshot,
        routes::list_session_runs,
        routes::delete_session,
    ),
    components(schemas(
        routes::HealthResponse,
        routes::CreateSessionRequest,
        routes::SnapshotResponse,
        error::ErrorResponse,
        orchestrator::SessionSummary,
        session_core::SessionState,
        session_core::RunState,
        session_core::RunStatus,
        session_core::ApprovalBrief,
        session_core::TranscriptItem,
        session_core::ErrorCode,
    )),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "sessions", description = "Session management endpoints"),
    )
)]
pub struct ApiDoc;

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health_check))
        .route("/api/openapi.json", get(openapi_json))
        .route(
            "/api/sessions",
            get(routes::list_sessions).post(routes::create_session),
        )
        .route(
            "/api/sessions/{id}",
            axum::routing::delete(routes::delete_session),
        )
        .route(
            "/api/sessions/{id}/snapshot",
            get(routes::get_session_snapshot),
        )
        .route("/api/sessions/{id}/runs", get(routes::list_session_runs))
        .route("/ws", get(routes::websocket_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
