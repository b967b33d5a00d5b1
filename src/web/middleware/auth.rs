use axum::{
    body::Body as AxumBody,
    extract::State,
    http::{Request, header},
    middleware::Next,
    response::Response,
};
use axum_extra::extract::cookie::CookieJar;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, errors::ErrorKind};
use std::sync::Arc;
use tracing::warn;

use crate::config::ServerConfig;
use crate::web::models::{Claims, SessionContext};
use crate::web::{AppState, error::AppError};

/// Validates an HS256 session token issued for this service's audience.
pub fn decode_session(config: &ServerConfig, token: &str) -> Result<SessionContext, AppError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_audience(&[config.jwt_audience.as_str()]);

    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(config.jwt_secret.as_ref()),
        &validation,
    )
    .map_err(|e| {
        warn!(error = ?e, "JWT decoding error.");
        match e.kind() {
            ErrorKind::ExpiredSignature => AppError::Unauthorized("Token has expired".to_string()),
            ErrorKind::InvalidAudience => AppError::Unauthorized("Token audience mismatch".to_string()),
            _ => AppError::Unauthorized("Invalid token".to_string()),
        }
    })?;

    if token_data.claims.sub.is_empty() {
        return Err(AppError::Unauthorized("Token has no subject".to_string()));
    }
    Ok(SessionContext {
        user_id: token_data.claims.sub,
        email: token_data.claims.email,
    })
}

pub async fn auth(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    mut req: Request<AxumBody>,
    next: Next,
) -> Result<Response, AppError> {
    // Authorization header first, then the session cookie
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|header| header.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
        .map(|s| s.to_string())
        .or_else(|| jar.get("token").map(|c| c.value().to_string()))
        .ok_or_else(|| AppError::Unauthorized("Missing authentication token".to_string()))?;

    let session = decode_session(&state.config, &token)?;
    req.extensions_mut().insert(session);
    Ok(next.run(req).await)
}
