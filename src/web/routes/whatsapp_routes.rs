use axum::{
    Json, Router,
    extract::{Extension, State},
    routing::{delete, get, post},
};
use std::sync::Arc;
use tracing::warn;

use crate::db::models::instance_name_for;
use crate::reconciler::ConnectionSnapshot;
use crate::web::models::{InstanceView, SessionContext};
use crate::web::{AppError, AppState};

// --- Route Handlers ---

async fn connect_handler(
    Extension(session): Extension<SessionContext>,
    State(app_state): State<Arc<AppState>>,
) -> Json<ConnectionSnapshot> {
    let reconciler = app_state.reconcilers.for_user(&session.user_id);
    let snapshot = reconciler.lock().await.mount().await;
    Json(snapshot)
}

async fn reload_handler(
    Extension(session): Extension<SessionContext>,
    State(app_state): State<Arc<AppState>>,
) -> Json<ConnectionSnapshot> {
    let reconciler = app_state.reconcilers.for_user(&session.user_id);
    let snapshot = reconciler.lock().await.reload().await;
    Json(snapshot)
}

/// Never waits on the reconciler lock, so a slow provisioning call still
/// reports `provisioning`.
async fn status_handler(
    Extension(session): Extension<SessionContext>,
    State(app_state): State<Arc<AppState>>,
) -> Json<ConnectionSnapshot> {
    Json(app_state.reconcilers.snapshot(&session.user_id))
}

async fn unmount_handler(
    Extension(session): Extension<SessionContext>,
    State(app_state): State<Arc<AppState>>,
) -> Json<ConnectionSnapshot> {
    let reconciler = app_state.reconcilers.for_user(&session.user_id);
    let snapshot = {
        let mut guard = reconciler.lock().await;
        guard.unmount();
        guard.snapshot()
    };
    drop(reconciler);
    app_state.reconcilers.release(&session.user_id);
    Json(snapshot)
}

async fn logout_handler(
    Extension(session): Extension<SessionContext>,
    State(app_state): State<Arc<AppState>>,
) -> Result<Json<ConnectionSnapshot>, AppError> {
    let reconciler = app_state.reconcilers.for_user(&session.user_id);
    let snapshot = reconciler.lock().await.logout().await?;
    Ok(Json(snapshot))
}

/// Persisted row next to what the gateway itself reports.
async fn instance_handler(
    Extension(session): Extension<SessionContext>,
    State(app_state): State<Arc<AppState>>,
) -> Result<Json<InstanceView>, AppError> {
    let instance_name = instance_name_for(&session.user_id);

    let record = app_state.store.find_instance(&session.user_id, &instance_name).await?;
    let gateway_state = app_state.gateway.instance_status(&instance_name).await;
    let gateway_entry = match app_state.gateway.fetch_instances().await {
        Ok(instances) => instances.into_iter().find(|i| i.instance_name == instance_name),
        Err(e) => {
            warn!(instance_name = %instance_name, error = %e, "Could not list gateway instances.");
            None
        }
    };

    Ok(Json(InstanceView {
        instance_name,
        record,
        gateway_state,
        gateway_entry,
    }))
}

pub fn whatsapp_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/connect", post(connect_handler))
        .route("/reload", post(reload_handler))
        .route("/status", get(status_handler))
        .route("/session", delete(unmount_handler))
        .route("/logout", post(logout_handler))
        .route("/instance", get(instance_handler))
}
