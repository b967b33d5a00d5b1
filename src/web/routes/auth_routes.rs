use axum::{
    Json, Router,
    extract::{Extension, State},
    routing::post,
};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use serde_json::{Value, json};
use std::sync::Arc;

use crate::web::models::SessionContext;
use crate::web::AppState;

/// Tears down the user's connection state and clears the session cookie.
async fn signout_handler(
    Extension(session): Extension<SessionContext>,
    State(app_state): State<Arc<AppState>>,
    jar: CookieJar,
) -> (CookieJar, Json<Value>) {
    let torn_down = app_state.reconcilers.sign_out(&session.user_id).await;
    let jar = jar.remove(Cookie::build("token").path("/"));
    (jar, Json(json!({ "signedOut": true, "connectionReset": torn_down })))
}

pub fn auth_router() -> Router<Arc<AppState>> {
    Router::new().route("/signout", post(signout_handler))
}
