use axum::{
    extract::{
        Query, State,
        ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::stream::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::reconciler::{ConnectionSnapshot, Reconciler};
use crate::web::middleware::auth::decode_session;
use crate::web::models::SessionContext;
use crate::web::{AppError, AppState};

#[derive(Deserialize, Debug)]
pub struct WebSocketAuthQuery {
    token: Option<String>,
}

/// Live connect view: mounts the reconciler on open, streams every snapshot,
/// and unmounts when the socket goes away. A sign-out elsewhere closes it.
pub async fn whatsapp_websocket_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<Arc<AppState>>,
    Query(query): Query<WebSocketAuthQuery>,
) -> impl IntoResponse {
    let Some(token) = query.token else {
        return AppError::Unauthorized("Missing authentication token".to_string()).into_response();
    };
    let session = match decode_session(&app_state.config, &token) {
        Ok(session) => session,
        Err(e) => return e.into_response(),
    };

    ws.on_upgrade(move |socket| handle_socket(socket, app_state, session))
}

async fn send_snapshot(socket: &mut WebSocket, snapshot: &ConnectionSnapshot) -> bool {
    match serde_json::to_string(snapshot) {
        Ok(json_data) => socket.send(Message::Text(Utf8Bytes::from(json_data))).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to serialize connection snapshot.");
            true
        }
    }
}

async fn handle_socket(mut socket: WebSocket, app_state: Arc<AppState>, session: SessionContext) {
    let reconciler = app_state.reconcilers.for_user(&session.user_id);

    // Subscribe before mounting so no transition is missed.
    let (mut rx, mut closed_rx) = {
        let mut guard = reconciler.lock().await;
        let rx = guard.subscribe();
        let closed_rx = guard.closed_signal();
        info!(user_id = %session.user_id, instance_name = %guard.instance_name(), "Connect view opened.");
        guard.mount().await;
        (rx, closed_rx)
    };

    let initial = rx.borrow_and_update().clone();
    let torn_down = *closed_rx.borrow();
    if torn_down || !send_snapshot(&mut socket, &initial).await {
        close_view(&app_state, reconciler, &session).await;
        return;
    }

    loop {
        tokio::select! {
            closed = closed_rx.changed() => {
                if closed.is_err() || *closed_rx.borrow() {
                    info!(user_id = %session.user_id, "Reconciler torn down; closing connect view.");
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
            }
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = rx.borrow_and_update().clone();
                if !send_snapshot(&mut socket, &snapshot).await {
                    debug!(user_id = %session.user_id, "Error sending snapshot. Breaking loop.");
                    break;
                }
            }
            msg = socket.next() => {
                match msg {
                    Some(Ok(Message::Text(t))) => match t.as_str() {
                        "reload" => {
                            reconciler.lock().await.reload().await;
                        }
                        "ping" => {
                            if socket.send(Message::Text(Utf8Bytes::from("pong"))).await.is_err() {
                                break;
                            }
                        }
                        other => debug!(user_id = %session.user_id, message = other, "Ignoring client message."),
                    },
                    Some(Ok(Message::Ping(p))) => {
                        if socket.send(Message::Pong(p)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(user_id = %session.user_id, error = %e, "WebSocket receive error.");
                        break;
                    }
                }
            }
        }
    }

    close_view(&app_state, reconciler, &session).await;
}

async fn close_view(app_state: &AppState, reconciler: Arc<Mutex<Reconciler>>, session: &SessionContext) {
    reconciler.lock().await.unmount();
    drop(reconciler);
    app_state.reconcilers.release(&session.user_id);
    info!(user_id = %session.user_id, "Connect view closed.");
}
