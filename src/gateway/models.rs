use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request body for `POST /instance/create`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstanceRequest<'a> {
    pub instance_name: &'a str,
    pub token: &'a str,
    pub qrcode: bool,
    pub integration: &'a str,
}

/// Outcome of a create call. HTTP 403 means the name is already taken by us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

/// Normalized result of `GET /instance/connect/{name}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QrCode {
    /// Data URI of the code to scan, exactly as the gateway sent it.
    Image(String),
    AlreadyOpen,
    Unavailable,
}

impl QrCode {
    /// Resolves the three response shapes the gateway uses: a top-level
    /// `base64`, a nested `qrcode.base64`, or neither (instance already linked).
    pub fn from_payload(payload: &Value) -> Self {
        if let Some(image) = non_empty_str(payload.get("base64")) {
            return QrCode::Image(image.to_string());
        }

        if let Some(qrcode) = payload.get("qrcode") {
            if let Some(image) = non_empty_str(qrcode.get("base64")) {
                return QrCode::Image(image.to_string());
            }
            if let Some(image) = non_empty_str(Some(qrcode)).filter(|s| s.starts_with("data:image")) {
                return QrCode::Image(image.to_string());
            }
            return QrCode::Unavailable;
        }

        match ConnectionState::from_payload(payload) {
            Some(ConnectionState::Open) => QrCode::AlreadyOpen,
            Some(_) => QrCode::Unavailable,
            None if payload.get("error").is_some() => QrCode::Unavailable,
            None => QrCode::AlreadyOpen,
        }
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|s| !s.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Open,
    Connecting,
    Close,
    Disconnected,
}

impl ConnectionState {
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "open" => ConnectionState::Open,
            "connecting" => ConnectionState::Connecting,
            "close" | "closed" => ConnectionState::Close,
            _ => ConnectionState::Disconnected,
        }
    }

    /// Reads `instance.state` (connectionState endpoint) or a bare `state`.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        payload
            .pointer("/instance/state")
            .or_else(|| payload.get("state"))
            .and_then(Value::as_str)
            .map(Self::parse)
    }

    pub fn is_open(self) -> bool {
        self == ConnectionState::Open
    }
}

/// One entry of `GET /instance/fetchInstances`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSummary {
    pub instance_name: String,
    pub owner: Option<String>,
    pub profile_name: Option<String>,
    pub status: ConnectionState,
}

impl InstanceSummary {
    /// Accepts both `{ instance: { instanceName, owner, profileName, status } }`
    /// and the flat `{ name, ownerJid, profileName, connectionStatus }` shape.
    pub fn from_payload(entry: &Value) -> Option<Self> {
        let (node, name_key, owner_key, status_key) = match entry.get("instance") {
            Some(inner) if inner.is_object() => (inner, "instanceName", "owner", "status"),
            _ => (entry, "name", "ownerJid", "connectionStatus"),
        };

        let instance_name = node
            .get(name_key)
            .or_else(|| node.get("instanceName"))
            .and_then(Value::as_str)?
            .to_string();

        Some(Self {
            instance_name,
            owner: node.get(owner_key).and_then(Value::as_str).map(str::to_string),
            profile_name: node.get("profileName").and_then(Value::as_str).map(str::to_string),
            status: node
                .get(status_key)
                .and_then(Value::as_str)
                .map(ConnectionState::parse)
                .unwrap_or(ConnectionState::Disconnected),
        })
    }
}

/// Push-notification target registered once an instance is linked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookSettings {
    pub url: String,
    pub events: Vec<String>,
    pub enabled: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SetWebhookRequest<'a> {
    pub webhook: WebhookBody<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WebhookBody<'a> {
    pub enabled: bool,
    pub url: &'a str,
    pub events: &'a [String],
    pub by_events: bool,
    pub base64: bool,
}

impl<'a> From<&'a WebhookSettings> for SetWebhookRequest<'a> {
    fn from(settings: &'a WebhookSettings) -> Self {
        Self {
            webhook: WebhookBody {
                enabled: settings.enabled,
                url: &settings.url,
                events: &settings.events,
                by_events: false,
                base64: false,
            },
        }
    }
}
