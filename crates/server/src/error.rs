use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use orchestrator::OrchestratorError;
use serde::Serialize;
use session_core::ErrorCode;
use utoipa::ToSchema;

#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
    Session(OrchestratorError),
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            AppError::Session(err) => match err.code() {
                ErrorCode::SessionNotFound => (StatusCode::NOT_FOUND, "not_found", err.to_string()),
                ErrorCode::InvalidCommand | ErrorCode::MissingField | ErrorCode::BadArgument => {
                    (StatusCode::BAD_REQUEST, "bad_request", err.to_string())
                }
                ErrorCode::Busy | ErrorCode::ApprovalConflict => {
                    (StatusCode::CONFLICT, "conflict", err.to_string())
                }
                _ => {
                    tracing::error!("Session error: {:?}", err);
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "session_error",
                        err.to_string(),
                    )
                }
            },
        };

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message,
        });

        (status, body).into_response()
    }
}

impl From<OrchestratorError> for AppError {
    fn from(err: OrchestratorError) -> Self {
        AppError::Session(err)
    }
}
