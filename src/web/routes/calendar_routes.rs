use axum::{
    Json, Router,
    extract::{Extension, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use chrono::DateTime;
use std::sync::Arc;
use tracing::info;

use crate::calendar::{CalendarError, CalendarEvent, NewCalendarEvent};
use crate::db::models::{CalendarCredentials, CalendarTokens};
use crate::web::models::{CalendarStatus, EventsQuery, SessionContext};
use crate::web::{AppError, AppState};

const DEFAULT_MAX_RESULTS: u32 = 10;
const MAX_RESULTS_CAP: u32 = 250;

async fn credentials_for(app_state: &AppState, user_id: &str) -> Result<CalendarCredentials, AppError> {
    app_state
        .store
        .calendar_credentials(user_id)
        .await?
        .ok_or_else(|| CalendarError::NotConnected.into())
}

// --- Route Handlers ---

async fn status_handler(
    Extension(session): Extension<SessionContext>,
    State(app_state): State<Arc<AppState>>,
) -> Result<Json<CalendarStatus>, AppError> {
    let connected = app_state.store.calendar_connected(&session.user_id).await?;
    Ok(Json(CalendarStatus { connected }))
}

async fn list_events_handler(
    Extension(session): Extension<SessionContext>,
    State(app_state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<CalendarEvent>>, AppError> {
    let credentials = credentials_for(&app_state, &session.user_id).await?;
    let max_results = query.max_results.unwrap_or(DEFAULT_MAX_RESULTS).clamp(1, MAX_RESULTS_CAP);
    let events = app_state.calendar.list_upcoming(&credentials, max_results).await?;
    Ok(Json(events))
}

async fn create_event_handler(
    Extension(session): Extension<SessionContext>,
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<NewCalendarEvent>,
) -> Result<(StatusCode, Json<CalendarEvent>), AppError> {
    if payload.summary.trim().is_empty() {
        return Err(AppError::InvalidInput("Event summary is required".to_string()));
    }
    let start = DateTime::parse_from_rfc3339(&payload.start)
        .map_err(|_| AppError::InvalidInput(format!("Invalid start time: {}", payload.start)))?;
    let end = DateTime::parse_from_rfc3339(&payload.end)
        .map_err(|_| AppError::InvalidInput(format!("Invalid end time: {}", payload.end)))?;
    if end <= start {
        return Err(AppError::InvalidInput("Event must end after it starts".to_string()));
    }

    let credentials = credentials_for(&app_state, &session.user_id).await?;
    let created = app_state.calendar.create_event(&credentials, &payload).await?;
    info!(user_id = %session.user_id, event_id = %created.id, "Calendar event created.");
    Ok((StatusCode::CREATED, Json(created)))
}

/// Stores provider tokens captured after a Google sign-in.
async fn save_tokens_handler(
    Extension(session): Extension<SessionContext>,
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<CalendarTokens>,
) -> Result<Json<CalendarStatus>, AppError> {
    if payload.access_token.trim().is_empty() {
        return Err(AppError::InvalidInput("accessToken is required".to_string()));
    }
    app_state.store.save_calendar_tokens(&session.user_id, &payload).await?;
    info!(user_id = %session.user_id, "Calendar tokens saved.");
    Ok(Json(CalendarStatus { connected: true }))
}

pub fn calendar_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/status", get(status_handler))
        .route("/events", get(list_events_handler).post(create_event_handler))
        .route("/tokens", post(save_tokens_handler))
}
