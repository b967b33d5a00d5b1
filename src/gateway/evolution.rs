use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use super::envelope::GatewayEnvelope;
use super::models::{
    ConnectionState, CreateInstanceRequest, CreateOutcome, InstanceSummary, QrCode, SetWebhookRequest,
    WebhookSettings,
};
use super::{GatewayError, MessagingGateway};
use crate::config::GatewayConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// HTTP client for the Evolution WhatsApp bridge, authenticated with a static `apikey` header.
pub struct EvolutionClient {
    client: Client,
    base_url: String,
    api_key: String,
    integration: String,
}

impl EvolutionClient {
    pub fn new(config: &GatewayConfig) -> Result<Self, GatewayError> {
        config
            .validate()
            .map_err(|e| GatewayError::Configuration(e.to_string()))?;

        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            integration: config.integration.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn instance_url(&self, action: &str, name: &str) -> String {
        self.url(&format!("/instance/{action}/{}", urlencoding::encode(name)))
    }

    async fn send(&self, request: RequestBuilder) -> Result<GatewayEnvelope, GatewayError> {
        let response = request.header("apikey", &self.api_key).send().await?;
        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Failed to read response body".to_string());
        Ok(GatewayEnvelope::from_body(status.as_u16(), &body))
    }

    /// Issues the request and insists on a 2xx answer.
    async fn send_ok(&self, request: RequestBuilder) -> Result<GatewayEnvelope, GatewayError> {
        let envelope = self.send(request).await?;
        if envelope.is_success() {
            Ok(envelope)
        } else {
            Err(GatewayError::Rejected(envelope))
        }
    }
}

#[async_trait]
impl MessagingGateway for EvolutionClient {
    async fn fetch_instances(&self) -> Result<Vec<InstanceSummary>, GatewayError> {
        let envelope = self
            .send_ok(self.client.get(self.url("/instance/fetchInstances")))
            .await?;

        match envelope.data {
            Some(Value::Array(entries)) => Ok(entries.iter().filter_map(InstanceSummary::from_payload).collect()),
            _ => Err(GatewayError::Malformed(format!(
                "fetchInstances did not return a list: {}",
                envelope.debug_info.raw_body.unwrap_or_default()
            ))),
        }
    }

    async fn create_instance(&self, name: &str) -> Result<CreateOutcome, GatewayError> {
        let body = CreateInstanceRequest {
            instance_name: name,
            token: name,
            qrcode: true,
            integration: &self.integration,
        };
        let envelope = self
            .send(self.client.post(self.url("/instance/create")).json(&body))
            .await?;

        if envelope.is_success() {
            debug!(instance_name = name, "Gateway instance created.");
            Ok(CreateOutcome::Created)
        } else if envelope.status() == StatusCode::FORBIDDEN.as_u16() {
            debug!(instance_name = name, "Gateway instance already exists.");
            Ok(CreateOutcome::AlreadyExists)
        } else {
            Err(GatewayError::Rejected(envelope))
        }
    }

    async fn connect_instance(&self, name: &str) -> Result<QrCode, GatewayError> {
        let envelope = self
            .send_ok(self.client.get(self.instance_url("connect", name)))
            .await?;

        Ok(envelope
            .data
            .as_ref()
            .map(QrCode::from_payload)
            .unwrap_or(QrCode::Unavailable))
    }

    async fn instance_status(&self, name: &str) -> ConnectionState {
        let request = self.client.get(self.instance_url("connectionState", name));
        match self.send(request).await {
            Ok(envelope) => envelope
                .data
                .as_ref()
                .and_then(ConnectionState::from_payload)
                .unwrap_or(ConnectionState::Disconnected),
            Err(e) => {
                warn!(instance_name = name, error = %e, "Status poll failed; reporting disconnected.");
                ConnectionState::Disconnected
            }
        }
    }

    async fn set_webhook(&self, name: &str, webhook: &WebhookSettings) -> Result<(), GatewayError> {
        let url = self.url(&format!("/webhook/set/{}", urlencoding::encode(name)));
        self.send_ok(self.client.post(url).json(&SetWebhookRequest::from(webhook)))
            .await?;
        Ok(())
    }

    async fn logout_instance(&self, name: &str) -> Result<(), GatewayError> {
        self.send_ok(self.client.delete(self.instance_url("logout", name)))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use serde_json::json;

    fn client_for(base_url: &str) -> EvolutionClient {
        EvolutionClient::new(&GatewayConfig {
            base_url: base_url.to_string(),
            api_key: "test-key".to_string(),
            integration: "WHATSAPP-BAILEYS".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn test_placeholder_config_is_refused() {
        let result = EvolutionClient::new(&GatewayConfig {
            base_url: "https://your-evolution-host".to_string(),
            api_key: "k".to_string(),
            integration: "WHATSAPP-BAILEYS".to_string(),
        });
        assert!(matches!(result, Err(GatewayError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_create_instance_sends_expected_body() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/instance/create")
            .match_header("apikey", "test-key")
            .match_body(Matcher::Json(json!({
                "instanceName": "wa_1234abcd",
                "token": "wa_1234abcd",
                "qrcode": true,
                "integration": "WHATSAPP-BAILEYS"
            })))
            .with_status(201)
            .with_body(r#"{"instance":{"instanceName":"wa_1234abcd","status":"created"}}"#)
            .create_async()
            .await;

        let outcome = client_for(&server.url()).create_instance("wa_1234abcd").await.unwrap();
        assert_eq!(outcome, CreateOutcome::Created);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_create_instance_tolerates_forbidden() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/instance/create")
            .with_status(403)
            .with_body(r#"{"status":403,"error":"Forbidden","response":{"message":["already in use"]}}"#)
            .create_async()
            .await;

        let outcome = client_for(&server.url()).create_instance("wa_1").await.unwrap();
        assert_eq!(outcome, CreateOutcome::AlreadyExists);
    }

    #[tokio::test]
    async fn test_create_instance_surfaces_other_statuses() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/instance/create")
            .with_status(500)
            .with_body("upstream exploded")
            .create_async()
            .await;

        let err = client_for(&server.url()).create_instance("wa_1").await.unwrap_err();
        let envelope = err.envelope().expect("rejected envelope");
        assert_eq!(envelope.status(), 500);
        assert_eq!(envelope.debug_info.raw_body.as_deref(), Some("upstream exploded"));
    }

    #[tokio::test]
    async fn test_connect_instance_returns_image() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/instance/connect/wa_1")
            .match_header("apikey", "test-key")
            .with_status(200)
            .with_body(r#"{"pairingCode":null,"code":"2@abc","base64":"data:image/png;base64,QR==","count":1}"#)
            .create_async()
            .await;

        let qr = client_for(&server.url()).connect_instance("wa_1").await.unwrap();
        assert_eq!(qr, QrCode::Image("data:image/png;base64,QR==".to_string()));
    }

    #[tokio::test]
    async fn test_status_reads_nested_state() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/instance/connectionState/wa_1")
            .with_status(200)
            .with_body(r#"{"instance":{"instanceName":"wa_1","state":"open"}}"#)
            .create_async()
            .await;

        let state = client_for(&server.url()).instance_status("wa_1").await;
        assert_eq!(state, ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_status_degrades_on_garbage_body() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/instance/connectionState/wa_1")
            .with_status(200)
            .with_body("not json at all")
            .create_async()
            .await;

        let state = client_for(&server.url()).instance_status("wa_1").await;
        assert_eq!(state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_status_degrades_on_transport_failure() {
        // Nothing listens on port 9 locally.
        let state = client_for("http://127.0.0.1:9").instance_status("wa_1").await;
        assert_eq!(state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_fetch_instances_normalizes_entries() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/instance/fetchInstances")
            .with_status(200)
            .with_body(r#"[{"name":"wa_1","connectionStatus":"open"},{"instance":{"instanceName":"wa_2","status":"close"}}]"#)
            .create_async()
            .await;

        let instances = client_for(&server.url()).fetch_instances().await.unwrap();
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].status, ConnectionState::Open);
        assert_eq!(instances[1].instance_name, "wa_2");
    }

    #[tokio::test]
    async fn test_set_webhook_and_logout() {
        let mut server = Server::new_async().await;
        let webhook = server
            .mock("POST", "/webhook/set/wa_1")
            .match_body(Matcher::PartialJson(json!({
                "webhook": { "enabled": true, "url": "https://hooks.salon.test/wa" }
            })))
            .with_status(201)
            .with_body("{}")
            .create_async()
            .await;
        let logout = server
            .mock("DELETE", "/instance/logout/wa_1")
            .with_status(200)
            .with_body(r#"{"status":"SUCCESS"}"#)
            .create_async()
            .await;

        let client = client_for(&server.url());
        client
            .set_webhook(
                "wa_1",
                &WebhookSettings {
                    url: "https://hooks.salon.test/wa".to_string(),
                    events: vec!["MESSAGES_UPSERT".to_string()],
                    enabled: true,
                },
            )
            .await
            .unwrap();
        client.logout_instance("wa_1").await.unwrap();

        webhook.assert_async().await;
        logout.assert_async().await;
    }
}
