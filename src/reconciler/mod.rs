//! Drives linking a WhatsApp number: create the instance, show a code,
//! poll until the phone confirms, or expire.
//!
//! ```text
//! idle ──calendar missing──▶ blocked
//!  │
//!  ▼
//! provisioning ──code──▶ awaiting_scan ──poll sees open──▶ open
//!  │    │                     │
//!  │    └─already linked──────┼──────────────────────────▶ open
//!  ▼                          ▼
//! error                    expired ──reload──▶ provisioning
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::db::models::{InstanceStatus, instance_name_for};
use crate::db::{SessionStore, StoreError};
use crate::gateway::{GatewayError, MessagingGateway, QrCode, WebhookSettings};

mod attempt;
pub mod registry;

use attempt::AttemptContext;
pub use registry::ReconcilerRegistry;

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("Could not save connection state: {0}")]
    Store(#[from] StoreError),
    #[error("The gateway did not return a code to scan")]
    NoScannableCode,
    #[error("Connection session has ended; sign in again")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    Idle,
    /// Calendar must be linked before messaging; no gateway traffic happens here.
    Blocked,
    Provisioning,
    AwaitingScan,
    Open,
    Expired,
    Error,
}

/// One provisioning cycle: the code on screen and its countdown.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionAttempt {
    pub scannable_code: String,
    pub expires_at: DateTime<Utc>,
    pub remaining_ticks: u32,
    pub poll_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    pub phase: ConnectionPhase,
    pub instance_name: String,
    pub countdown_ticks: u32,
    pub attempt: Option<ConnectionAttempt>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ConnectionSnapshot {
    fn idle(instance_name: &str, countdown_ticks: u32) -> Self {
        Self {
            phase: ConnectionPhase::Idle,
            instance_name: instance_name.to_string(),
            countdown_ticks,
            attempt: None,
            error: None,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub countdown_ticks: u32,
    pub poll_every: u32,
    pub tick: Duration,
    pub webhook: Option<WebhookSettings>,
}

impl ReconcilerSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            countdown_ticks: config.timing.countdown_ticks,
            poll_every: config.timing.poll_every,
            tick: config.timing.tick,
            webhook: config.webhook_url.as_ref().map(|url| WebhookSettings {
                url: url.clone(),
                events: config.webhook_events.clone(),
                enabled: true,
            }),
        }
    }
}

/// External collaborators a reconciler talks to.
#[derive(Clone)]
pub struct ConnectServices {
    pub gateway: Arc<dyn MessagingGateway>,
    pub store: Arc<dyn SessionStore>,
}

/// Owns the connection lifecycle of one user's instance and the single
/// countdown task of its live attempt. Dropping it cancels that task.
pub struct Reconciler {
    ctx: Arc<AttemptContext>,
    poller: Option<JoinHandle<()>>,
}

impl Reconciler {
    pub fn new(user_id: &str, services: ConnectServices, settings: ReconcilerSettings) -> Self {
        let ctx = AttemptContext::new(user_id.to_string(), instance_name_for(user_id), services, settings);
        Self {
            ctx: Arc::new(ctx),
            poller: None,
        }
    }

    pub fn instance_name(&self) -> &str {
        &self.ctx.instance_name
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.ctx.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.ctx.subscribe()
    }

    pub fn has_active_poller(&self) -> bool {
        self.poller.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    pub fn is_closed(&self) -> bool {
        self.ctx.is_closed()
    }

    /// Flips to `true` once the reconciler has been torn down.
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.ctx.subscribe_closed()
    }

    /// Sign-out teardown. Every later call is a no-op, so a handle that
    /// outlives the registry entry can never start another poller.
    pub fn close(&mut self) {
        if let Some(handle) = self.poller.take() {
            handle.abort();
        }
        self.ctx.close();
    }

    /// Entry point when the connect view opens.
    ///
    /// The calendar check completes before any gateway call is issued; without
    /// a calendar link the reconciler parks in `Blocked`.
    pub async fn mount(&mut self) -> ConnectionSnapshot {
        if self.is_closed() || self.snapshot().phase == ConnectionPhase::Open {
            return self.snapshot();
        }
        let generation = self.cancel_poller();

        let calendar_linked = self.ctx.services.store.calendar_connected(&self.ctx.user_id).await;
        match calendar_linked {
            Ok(true) => self.start_attempt().await,
            Ok(false) => {
                info!(user_id = %self.ctx.user_id, "Calendar not linked; messaging connect blocked.");
                self.ctx.publish_if(generation, |s| {
                    s.phase = ConnectionPhase::Blocked;
                    s.attempt = None;
                    s.error = None;
                });
                self.snapshot()
            }
            Err(e) => {
                self.ctx.fail(generation, format!("Could not verify calendar link: {e}"));
                self.snapshot()
            }
        }
    }

    /// User asked for a fresh code.
    pub async fn reload(&mut self) -> ConnectionSnapshot {
        if self.is_closed() {
            return self.snapshot();
        }
        match self.snapshot().phase {
            ConnectionPhase::Open | ConnectionPhase::Provisioning => self.snapshot(),
            ConnectionPhase::Idle | ConnectionPhase::Blocked | ConnectionPhase::Error => self.mount().await,
            ConnectionPhase::AwaitingScan | ConnectionPhase::Expired => self.start_attempt().await,
        }
    }

    /// The view went away: stop every timer and drop any code still on screen.
    pub fn unmount(&mut self) {
        let generation = self.cancel_poller();
        self.ctx.publish_if(generation, |s| {
            if matches!(s.phase, ConnectionPhase::Provisioning | ConnectionPhase::AwaitingScan) {
                s.phase = ConnectionPhase::Idle;
                s.attempt = None;
            }
        });
    }

    /// Unlinks the phone and returns the instance to `uninitialized`.
    pub async fn logout(&mut self) -> Result<ConnectionSnapshot, ReconcileError> {
        if self.is_closed() {
            return Err(ReconcileError::Closed);
        }
        let generation = self.cancel_poller();

        if let Err(e) = self.ctx.services.gateway.logout_instance(&self.ctx.instance_name).await {
            self.ctx.fail(generation, e.to_string());
            return Err(e.into());
        }
        if let Err(e) = self
            .ctx
            .services
            .store
            .upsert_instance_status(&self.ctx.user_id, &self.ctx.instance_name, InstanceStatus::Uninitialized)
            .await
        {
            let err = ReconcileError::from(e);
            self.ctx.fail(generation, err.to_string());
            return Err(err);
        }

        self.ctx.publish_if(generation, |s| {
            s.phase = ConnectionPhase::Idle;
            s.attempt = None;
            s.error = None;
        });
        info!(user_id = %self.ctx.user_id, instance_name = %self.ctx.instance_name, "WhatsApp instance logged out.");
        Ok(self.snapshot())
    }

    /// Aborts the countdown task (if any) and supersedes its attempt.
    fn cancel_poller(&mut self) -> u64 {
        let generation = self.ctx.invalidate();
        if let Some(handle) = self.poller.take() {
            handle.abort();
        }
        generation
    }

    async fn start_attempt(&mut self) -> ConnectionSnapshot {
        if self.is_closed() {
            return self.snapshot();
        }
        let generation = self.cancel_poller();
        let countdown_ticks = self.ctx.settings.countdown_ticks;
        self.ctx.publish_if(generation, |s| {
            s.phase = ConnectionPhase::Provisioning;
            s.countdown_ticks = countdown_ticks;
            s.attempt = None;
            s.error = None;
        });
        info!(user_id = %self.ctx.user_id, instance_name = %self.ctx.instance_name, "Starting connection attempt.");

        let provisioned = self.ctx.provision().await;
        match provisioned {
            Ok(QrCode::Image(code)) => {
                let fresh = ConnectionAttempt::new(code, &self.ctx.settings);
                self.ctx.publish_if(generation, |s| {
                    s.phase = ConnectionPhase::AwaitingScan;
                    s.attempt = Some(fresh);
                });
                self.poller = Some(tokio::spawn(attempt::run_countdown(self.ctx.clone(), generation)));
            }
            Ok(QrCode::AlreadyOpen) => {
                // A linked answer from connect is only trusted once the state endpoint agrees.
                let state = self.ctx.services.gateway.instance_status(&self.ctx.instance_name).await;
                if state.is_open() {
                    self.ctx.confirm_open(generation).await;
                } else {
                    warn!(instance_name = %self.ctx.instance_name, ?state, "Connect reported linked but state disagrees.");
                    self.ctx.fail(
                        generation,
                        format!("Gateway reported the number as linked, but its state is {state:?}"),
                    );
                }
            }
            Ok(QrCode::Unavailable) => self.ctx.fail(generation, ReconcileError::NoScannableCode.to_string()),
            Err(e) => self.ctx.fail(generation, e.to_string()),
        }

        self.snapshot()
    }
}

impl Drop for Reconciler {
    fn drop(&mut self) {
        if let Some(handle) = self.poller.take() {
            handle.abort();
        }
    }
}
