use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{ConnectServices, ConnectionAttempt, ConnectionPhase, ConnectionSnapshot, ReconcileError, ReconcilerSettings};
use crate::db::models::InstanceStatus;
use crate::gateway::QrCode;

/// State shared between a reconciler and the countdown task it spawns.
///
/// Every write is tagged with the generation of the attempt that produced it;
/// writes from an attempt that has since been superseded are dropped.
pub(super) struct AttemptContext {
    pub(super) user_id: String,
    pub(super) instance_name: String,
    pub(super) services: ConnectServices,
    pub(super) settings: ReconcilerSettings,
    state: watch::Sender<ConnectionSnapshot>,
    generation: AtomicU64,
    closed: watch::Sender<bool>,
}

impl AttemptContext {
    pub(super) fn new(
        user_id: String,
        instance_name: String,
        services: ConnectServices,
        settings: ReconcilerSettings,
    ) -> Self {
        let initial = ConnectionSnapshot::idle(&instance_name, settings.countdown_ticks);
        let (state, _) = watch::channel(initial);
        Self {
            user_id,
            instance_name,
            services,
            settings,
            state,
            generation: AtomicU64::new(0),
            closed: watch::Sender::new(false),
        }
    }

    pub(super) fn snapshot(&self) -> ConnectionSnapshot {
        self.state.borrow().clone()
    }

    pub(super) fn subscribe(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.state.subscribe()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    pub(super) fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub(super) fn subscribe_closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Final teardown: supersedes every attempt, resets to idle and refuses
    /// all later writes.
    pub(super) fn close(&self) {
        self.state.send_modify(|s| {
            self.generation.fetch_add(1, Ordering::SeqCst);
            self.closed.send_replace(true);
            s.phase = ConnectionPhase::Idle;
            s.attempt = None;
            s.error = None;
            s.updated_at = Utc::now();
        });
    }

    /// Supersedes whatever attempt is running and returns the new generation.
    pub(super) fn invalidate(&self) -> u64 {
        let mut next = 0;
        // Bumped under the watch lock so no stale write can interleave.
        self.state.send_modify(|_| {
            next = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        });
        next
    }

    /// Applies `change` only while `generation` is still the live attempt.
    pub(super) fn publish_if(&self, generation: u64, change: impl FnOnce(&mut ConnectionSnapshot)) -> bool {
        self.state.send_if_modified(|snapshot| {
            if self.is_closed() || !self.is_current(generation) {
                return false;
            }
            change(snapshot);
            snapshot.updated_at = Utc::now();
            true
        })
    }

    pub(super) fn fail(&self, generation: u64, message: String) {
        warn!(user_id = %self.user_id, instance_name = %self.instance_name, error = %message, "Connection attempt failed.");
        self.publish_if(generation, |s| {
            s.phase = ConnectionPhase::Error;
            s.attempt = None;
            s.error = Some(message);
        });
    }

    /// Persists `provisioning`, makes sure the instance exists, then asks for a code.
    pub(super) async fn provision(&self) -> Result<QrCode, ReconcileError> {
        self.services
            .store
            .upsert_instance_status(&self.user_id, &self.instance_name, InstanceStatus::Provisioning)
            .await?;

        let outcome = self.services.gateway.create_instance(&self.instance_name).await?;
        debug!(instance_name = %self.instance_name, ?outcome, "Instance provisioned.");

        Ok(self.services.gateway.connect_instance(&self.instance_name).await?)
    }

    /// Side effects of a confirmed link, then the transition itself.
    ///
    /// A failed webhook registration is logged and does not keep the instance
    /// from being reported open.
    pub(super) async fn confirm_open(&self, generation: u64) {
        if self.is_closed() || !self.is_current(generation) {
            return;
        }

        if let Err(e) = self
            .services
            .store
            .upsert_instance_status(&self.user_id, &self.instance_name, InstanceStatus::Open)
            .await
        {
            warn!(user_id = %self.user_id, instance_name = %self.instance_name, error = %e, "Failed to persist open status.");
        }

        if let Some(webhook) = &self.settings.webhook {
            match self.services.gateway.set_webhook(&self.instance_name, webhook).await {
                Ok(()) => info!(instance_name = %self.instance_name, url = %webhook.url, "Webhook registered."),
                Err(e) => warn!(instance_name = %self.instance_name, error = %e, "Webhook registration failed; connection stays open."),
            }
        }

        if self.publish_if(generation, |s| {
            s.phase = ConnectionPhase::Open;
            s.attempt = None;
            s.error = None;
        }) {
            info!(user_id = %self.user_id, instance_name = %self.instance_name, "WhatsApp instance linked.");
        }
    }
}

/// Counts the attempt down one tick at a time and polls the gateway every
/// `poll_every` ticks until the instance opens or the countdown runs out.
pub(super) async fn run_countdown(ctx: Arc<AttemptContext>, generation: u64) {
    let tick = ctx.settings.tick;
    let poll_every = ctx.settings.poll_every.max(1);
    let total = ctx.settings.countdown_ticks;

    let mut ticker = time::interval_at(Instant::now() + tick, tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut elapsed: u32 = 0;

    loop {
        ticker.tick().await;
        elapsed += 1;
        let remaining = total.saturating_sub(elapsed);

        let live = ctx.publish_if(generation, |s| {
            if let Some(attempt) = s.attempt.as_mut() {
                attempt.remaining_ticks = remaining;
            }
        });
        if !live {
            return;
        }

        if elapsed % poll_every == 0 {
            ctx.publish_if(generation, |s| {
                if let Some(attempt) = s.attempt.as_mut() {
                    attempt.poll_count += 1;
                }
            });
            let state = ctx.services.gateway.instance_status(&ctx.instance_name).await;
            debug!(instance_name = %ctx.instance_name, ?state, remaining, "Polled connection state.");
            if state.is_open() {
                ctx.confirm_open(generation).await;
                return;
            }
        }

        if remaining == 0 {
            let expired = ctx.publish_if(generation, |s| {
                s.phase = ConnectionPhase::Expired;
                s.attempt = None;
            });
            if expired {
                info!(instance_name = %ctx.instance_name, "QR code expired without a scan.");
            }
            return;
        }
    }
}

impl ConnectionAttempt {
    pub(super) fn new(scannable_code: String, settings: &ReconcilerSettings) -> Self {
        let lifetime = settings.tick * settings.countdown_ticks;
        let expires_at = Utc::now() + chrono::Duration::from_std(lifetime).unwrap_or_else(|_| chrono::Duration::zero());
        Self {
            scannable_code,
            expires_at,
            remaining_ticks: settings.countdown_ticks,
            poll_count: 0,
        }
    }
}
