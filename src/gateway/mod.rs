use async_trait::async_trait;
use thiserror::Error;

pub mod envelope;
pub mod evolution;
pub mod models;

pub use envelope::GatewayEnvelope;
pub use models::{ConnectionState, CreateOutcome, InstanceSummary, QrCode, WebhookSettings};

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Gateway is not configured: {0}")]
    Configuration(String),
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Gateway request failed ({})", .0.summary())]
    Rejected(GatewayEnvelope),
    #[error("Unexpected gateway response: {0}")]
    Malformed(String),
}

impl GatewayError {
    /// Envelope with the raw status/body, when the gateway answered at all.
    pub fn envelope(&self) -> Option<&GatewayEnvelope> {
        match self {
            GatewayError::Rejected(envelope) => Some(envelope),
            _ => None,
        }
    }
}

/// Operations against the messaging bridge the reconciler depends on.
#[async_trait]
pub trait MessagingGateway: Send + Sync {
    async fn fetch_instances(&self) -> Result<Vec<InstanceSummary>, GatewayError>;

    /// Provisions `name`, treating an "already exists" answer as success.
    async fn create_instance(&self, name: &str) -> Result<CreateOutcome, GatewayError>;

    async fn connect_instance(&self, name: &str) -> Result<QrCode, GatewayError>;

    /// Never fails: transport or decoding problems read as `Disconnected`
    /// so background polling keeps running.
    async fn instance_status(&self, name: &str) -> ConnectionState;

    async fn set_webhook(&self, name: &str, webhook: &WebhookSettings) -> Result<(), GatewayError>;

    async fn logout_instance(&self, name: &str) -> Result<(), GatewayError>;
}
