use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info};

use super::{ConnectServices, ConnectionPhase, ConnectionSnapshot, Reconciler, ReconcilerSettings};
use crate::db::models::instance_name_for;

struct UserSlot {
    reconciler: Arc<Mutex<Reconciler>>,
    // Read side of the reconciler's state, usable while a mount holds the lock.
    state: watch::Receiver<ConnectionSnapshot>,
}

/// One reconciler per signed-in user, created on first use.
pub struct ReconcilerRegistry {
    services: ConnectServices,
    settings: ReconcilerSettings,
    reconcilers: DashMap<String, UserSlot>,
}

impl ReconcilerRegistry {
    pub fn new(services: ConnectServices, settings: ReconcilerSettings) -> Self {
        Self {
            services,
            settings,
            reconcilers: DashMap::new(),
        }
    }

    pub fn for_user(&self, user_id: &str) -> Arc<Mutex<Reconciler>> {
        self.reconcilers
            .entry(user_id.to_string())
            .or_insert_with(|| {
                let reconciler = Reconciler::new(user_id, self.services.clone(), self.settings.clone());
                let state = reconciler.subscribe();
                UserSlot {
                    reconciler: Arc::new(Mutex::new(reconciler)),
                    state,
                }
            })
            .reconciler
            .clone()
    }

    /// Latest state without waiting on an in-flight mount or reload.
    pub fn snapshot(&self, user_id: &str) -> ConnectionSnapshot {
        match self.reconcilers.get(user_id) {
            Some(slot) => slot.state.borrow().clone(),
            None => ConnectionSnapshot::idle(&instance_name_for(user_id), self.settings.countdown_ticks),
        }
    }

    /// Drops the user's reconciler once the connect view is gone, unless it is
    /// linked, still working, or referenced by another view.
    pub fn release(&self, user_id: &str) -> bool {
        let evicted = self
            .reconcilers
            .remove_if(user_id, |_, slot| {
                let idle = matches!(
                    slot.state.borrow().phase,
                    ConnectionPhase::Idle | ConnectionPhase::Blocked | ConnectionPhase::Expired | ConnectionPhase::Error
                );
                idle && Arc::strong_count(&slot.reconciler) == 1
            })
            .is_some();
        if evicted {
            debug!(user_id, "Idle reconciler released.");
        }
        evicted
    }

    /// Tears the user's reconciler down for good. Handles still held elsewhere
    /// see a closed reconciler and cannot start polling again.
    pub async fn sign_out(&self, user_id: &str) -> bool {
        let Some((_, slot)) = self.reconcilers.remove(user_id) else {
            return false;
        };
        slot.reconciler.lock().await.close();
        info!(user_id, "Connection state torn down on sign-out.");
        true
    }

    pub fn len(&self) -> usize {
        self.reconcilers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reconcilers.is_empty()
    }
}
