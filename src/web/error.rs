use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::calendar::CalendarError;
use crate::db::StoreError;
use crate::gateway::GatewayError;
use crate::reconciler::ReconcileError;

/// Machine-readable code the dashboard uses to offer a calendar reconnect
/// instead of a sign-in prompt.
pub const CALENDAR_RECONNECT_CODE: &str = "calendar_reconnect_required";

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Precondition failed: {0}")]
    Precondition(String),
    #[error("Calendar reconnect required: {0}")]
    CalendarReconnect(String),
    #[error("Upstream error: {0}")]
    Upstream(String),
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Internal server error: {0}")]
    InternalServerError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::Precondition(msg) => (StatusCode::PRECONDITION_FAILED, msg),
            AppError::CalendarReconnect(msg) => {
                // 401 is reserved for the dashboard session itself.
                let body = json!({ "error": msg, "code": CALENDAR_RECONNECT_CODE });
                return (StatusCode::FAILED_DEPENDENCY, Json(body)).into_response();
            }
            AppError::Upstream(msg) => (StatusCode::BAD_GATEWAY, msg),
            AppError::DatabaseError(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Database error: {msg}"),
            ),
            AppError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({ "error": error_message }))).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        AppError::DatabaseError(err.to_string())
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Configuration(msg) => AppError::InternalServerError(msg),
            other => AppError::Upstream(other.to_string()),
        }
    }
}

impl From<ReconcileError> for AppError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::Gateway(e) => e.into(),
            ReconcileError::Store(e) => e.into(),
            ReconcileError::Closed => AppError::Unauthorized(err.to_string()),
            ReconcileError::NoScannableCode => AppError::Upstream(err.to_string()),
        }
    }
}

impl From<CalendarError> for AppError {
    fn from(err: CalendarError) -> Self {
        match err {
            CalendarError::NotConnected => AppError::Precondition(err.to_string()),
            CalendarError::ReconnectRequired => AppError::CalendarReconnect(err.to_string()),
            CalendarError::Api { .. } | CalendarError::Network(_) => AppError::Upstream(err.to_string()),
        }
    }
}
