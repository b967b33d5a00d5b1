use axum::{
    Json, Router,
    http::Method,
    middleware as axum_middleware,
    routing::get,
};
use serde_json::{Value, json};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::calendar::GoogleCalendarClient;
use crate::config::ServerConfig;
use crate::db::SessionStore;
use crate::gateway::MessagingGateway;
use crate::reconciler::{ConnectServices, ReconcilerRegistry, ReconcilerSettings};
use crate::version::VERSION;
use crate::web::middleware::auth;
use crate::web::routes::*;

pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod websocket_handler;

pub use error::AppError;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub store: Arc<dyn SessionStore>,
    pub gateway: Arc<dyn MessagingGateway>,
    pub calendar: Arc<GoogleCalendarClient>,
    pub reconcilers: Arc<ReconcilerRegistry>,
}

impl AppState {
    pub fn new(
        config: Arc<ServerConfig>,
        store: Arc<dyn SessionStore>,
        gateway: Arc<dyn MessagingGateway>,
        calendar: Arc<GoogleCalendarClient>,
    ) -> Self {
        let services = ConnectServices {
            gateway: gateway.clone(),
            store: store.clone(),
        };
        let reconcilers = Arc::new(ReconcilerRegistry::new(services, ReconcilerSettings::from_config(&config)));
        Self {
            config,
            store,
            gateway,
            calendar,
            reconcilers,
        }
    }
}

async fn health_check_handler() -> Json<Value> {
    Json(json!({ "status": "ok", "version": VERSION }))
}

pub fn create_axum_router(app_state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(vec![Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health_check_handler))
        .route("/ws/whatsapp", get(websocket_handler::whatsapp_websocket_handler))
        .nest(
            "/api/whatsapp",
            whatsapp_routes::whatsapp_router()
                .route_layer(axum_middleware::from_fn_with_state(app_state.clone(), auth::auth)),
        )
        .nest(
            "/api/calendar",
            calendar_routes::calendar_router()
                .route_layer(axum_middleware::from_fn_with_state(app_state.clone(), auth::auth)),
        )
        .nest(
            "/api/auth",
            auth_routes::auth_router().route_layer(axum_middleware::from_fn_with_state(app_state.clone(), auth::auth)),
        )
        .with_state(app_state)
        .layer(cors)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{ConnectTiming, GatewayConfig};
    use crate::db::{DbSessionStore, create_schema};
    use crate::gateway::evolution::EvolutionClient;
    use crate::web::models::Claims;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use http_body_util::BodyExt;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use mockito::{Matcher, Server, ServerGuard};
    use sea_orm::Database;
    use std::time::Duration;
    use tower::ServiceExt;

    const USER: &str = "9c4e2b7a-1111-2222-3333-444455556666";

    pub(crate) fn test_config() -> ServerConfig {
        ServerConfig {
            listen_address: "127.0.0.1:0".to_string(),
            database_url: "sqlite::memory:".to_string(),
            jwt_secret: "salon-test-secret".to_string(),
            jwt_audience: "authenticated".to_string(),
            gateway: GatewayConfig {
                base_url: "http://127.0.0.1:9".to_string(),
                api_key: "k3y".to_string(),
                integration: "WHATSAPP-BAILEYS".to_string(),
            },
            webhook_url: None,
            webhook_events: vec!["MESSAGES_UPSERT".to_string()],
            timing: ConnectTiming {
                countdown_ticks: 40,
                poll_every: 5,
                tick: Duration::from_secs(1),
            },
            calendar_api_url: "http://127.0.0.1:9".to_string(),
            log_dir: "logs".to_string(),
        }
    }

    struct Harness {
        router: Router,
        state: Arc<AppState>,
        gateway: ServerGuard,
        calendar: ServerGuard,
        _dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let gateway = Server::new_async().await;
        let calendar = Server::new_async().await;
        let dir = tempfile::tempdir().unwrap();
        let db = Database::connect(format!("sqlite://{}/web.db?mode=rwc", dir.path().display()))
            .await
            .unwrap();
        create_schema(&db).await.unwrap();

        let mut config = test_config();
        config.gateway.base_url = gateway.url();
        config.calendar_api_url = calendar.url();

        let evolution = EvolutionClient::new(&config.gateway).unwrap();
        let calendar_client = GoogleCalendarClient::new(&config.calendar_api_url).unwrap();
        let state = Arc::new(AppState::new(
            Arc::new(config),
            Arc::new(DbSessionStore::new(db)),
            Arc::new(evolution),
            Arc::new(calendar_client),
        ));
        Harness {
            router: create_axum_router(state.clone()),
            state,
            gateway,
            calendar,
            _dir: dir,
        }
    }

    fn bearer() -> String {
        let claims = Claims {
            sub: USER.to_string(),
            aud: "authenticated".to_string(),
            exp: (chrono::Utc::now().timestamp() + 3600) as usize,
            email: None,
        };
        let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(b"salon-test-secret")).unwrap();
        format!("Bearer {token}")
    }

    fn request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, bearer());
        match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(router: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    #[tokio::test]
    async fn test_health_is_public_and_api_requires_token() {
        let h = harness().await;

        let (status, body) = send(&h.router, Request::get("/api/health").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = send(
            &h.router,
            Request::get("/api/whatsapp/status").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_connect_is_blocked_until_calendar_tokens_arrive() {
        let mut h = harness().await;
        let untouched = h
            .gateway
            .mock("POST", "/instance/create")
            .expect(0)
            .create_async()
            .await;

        let (status, body) = send(&h.router, request("POST", "/api/whatsapp/connect", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["phase"], "blocked");
        untouched.assert_async().await;

        let (status, body) = send(&h.router, request("GET", "/api/calendar/events", None)).await;
        assert_eq!(status, StatusCode::PRECONDITION_FAILED);
        assert!(body["error"].as_str().unwrap().contains("not connected"));
    }

    #[tokio::test]
    async fn test_connect_shows_code_and_sign_out_resets() {
        let mut h = harness().await;
        h.gateway
            .mock("POST", "/instance/create")
            .with_status(403)
            .with_body(r#"{"status":403,"error":"Forbidden","response":{"message":["This name is already in use."]}}"#)
            .create_async()
            .await;
        h.gateway
            .mock("GET", "/instance/connect/wa_9c4e2b7a")
            .with_status(200)
            .with_body(r#"{"base64":"data:image/png;base64,QUJD","code":"2@abc"}"#)
            .create_async()
            .await;

        let (status, body) = send(
            &h.router,
            request("POST", "/api/calendar/tokens", Some(json!({ "accessToken": "ya29.live" }))),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["connected"], true);

        let (status, body) = send(&h.router, request("POST", "/api/whatsapp/connect", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["phase"], "awaiting_scan");
        assert_eq!(body["instanceName"], "wa_9c4e2b7a");
        assert_eq!(body["attempt"]["scannableCode"], "data:image/png;base64,QUJD");
        assert_eq!(body["attempt"]["remainingTicks"], 40);

        let (_, body) = send(&h.router, request("GET", "/api/whatsapp/status", None)).await;
        assert_eq!(body["phase"], "awaiting_scan");

        let (status, body) = send(&h.router, request("POST", "/api/auth/signout", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["connectionReset"], true);
        assert!(h.state.reconcilers.is_empty());
    }

    #[tokio::test]
    async fn test_calendar_events_proxy_and_validation() {
        let mut h = harness().await;
        h.calendar
            .mock("GET", "/calendars/primary/events")
            .match_header("authorization", "Bearer ya29.live")
            .match_query(Matcher::UrlEncoded("maxResults".into(), "5".into()))
            .with_status(200)
            .with_body(r#"{"items":[{"id":"ev1","summary":"Escova","start":{"dateTime":"2026-10-20T09:00:00Z"},"end":{"dateTime":"2026-10-20T10:00:00Z"}}]}"#)
            .create_async()
            .await;

        send(
            &h.router,
            request("POST", "/api/calendar/tokens", Some(json!({ "accessToken": "ya29.live" }))),
        )
        .await;

        let (status, body) = send(&h.router, request("GET", "/api/calendar/events?max_results=5", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["summary"], "Escova");

        let (status, _) = send(
            &h.router,
            request(
                "POST",
                "/api/calendar/events",
                Some(json!({ "summary": "Corte", "start": "2026-10-20T11:00:00Z", "end": "2026-10-20T10:00:00Z" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_revoked_calendar_grant_asks_for_reconnect_not_sign_in() {
        let mut h = harness().await;
        h.calendar
            .mock("GET", "/calendars/primary/events")
            .match_query(Matcher::Any)
            .with_status(401)
            .with_body(r#"{"error":{"code":401,"message":"Invalid Credentials"}}"#)
            .create_async()
            .await;

        send(
            &h.router,
            request("POST", "/api/calendar/tokens", Some(json!({ "accessToken": "ya29.revoked" }))),
        )
        .await;

        let (status, body) = send(&h.router, request("GET", "/api/calendar/events", None)).await;
        assert_eq!(status, StatusCode::FAILED_DEPENDENCY);
        assert_eq!(body["code"], error::CALENDAR_RECONNECT_CODE);
        assert!(body["error"].is_string());

        // The dashboard session itself is still good.
        let (status, body) = send(&h.router, request("GET", "/api/calendar/status", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["connected"], true);
    }
}
