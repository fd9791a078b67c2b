//! Process-wide connection manager. One instance per process owns every
//! per-session table (registry, scheduler, rate-limit counters, key-error
//! windows) instead of free-floating module globals.

use crate::config::WbotConfig;
use crate::error::WbotError;
use crate::fanout::EventBus;
use crate::registry::{ConnectionHandle, SessionRegistry};
use crate::scheduler::{ReconnectScheduler, SchedulerTuning};
use crate::store::SessionStore;
use crate::transport::TransportFactory;
use crate::version::VersionProvider;
use dashmap::DashMap;
use log::{info, warn};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Instant;

pub struct ConnectionManager {
    pub(crate) config: WbotConfig,
    pub(crate) store: Arc<dyn SessionStore>,
    pub(crate) factory: Arc<dyn TransportFactory>,
    pub(crate) version_provider: Option<Arc<dyn VersionProvider>>,

    pub(crate) registry: SessionRegistry,
    pub(crate) scheduler: ReconnectScheduler,
    pub(crate) bus: EventBus,

    /// Guards against two concurrent `start_session` calls for one id.
    pub(crate) connecting: DashMap<i64, ()>,
    /// Rate-limited close counter, tracked separately from the general
    /// reconnect attempt counter.
    pub(crate) rate_limit_attempts: DashMap<i64, u32>,
    /// Sliding window of mid-session key-integrity errors.
    pub(crate) key_errors: DashMap<i64, VecDeque<Instant>>,
    /// Shutdown signal for the event pump of each running session.
    pub(crate) pump_shutdown: DashMap<i64, Arc<Notify>>,
}

impl ConnectionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        factory: Arc<dyn TransportFactory>,
        version_provider: Option<Arc<dyn VersionProvider>>,
        config: WbotConfig,
    ) -> Arc<Self> {
        let tuning = SchedulerTuning {
            floor: config.reconnect_floor,
            min_interval: config.min_attempt_interval,
            max_exponent: config.max_backoff_exponent,
        };
        Arc::new(Self {
            config,
            store,
            factory,
            version_provider,
            registry: SessionRegistry::new(),
            scheduler: ReconnectScheduler::new(tuning),
            bus: EventBus::new(),
            connecting: DashMap::new(),
            rate_limit_attempts: DashMap::new(),
            key_errors: DashMap::new(),
            pump_shutdown: DashMap::new(),
        })
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn scheduler(&self) -> &ReconnectScheduler {
        &self.scheduler
    }

    /// Live handle for the session, or `NotInitialized`. A tenant mismatch
    /// also reports `NotInitialized` rather than exposing the handle.
    pub fn get_active_handle(
        &self,
        session_id: i64,
        tenant_id: Option<i64>,
    ) -> Result<Arc<ConnectionHandle>, WbotError> {
        self.registry
            .find(session_id, tenant_id)
            .ok_or(WbotError::NotInitialized(session_id))
    }

    /// Non-throwing variant of [`Self::get_active_handle`].
    pub fn try_get_active_handle(
        &self,
        session_id: i64,
        tenant_id: Option<i64>,
    ) -> Option<Arc<ConnectionHandle>> {
        self.registry.find(session_id, tenant_id)
    }

    /// Explicit teardown, used by logout flows. Cancels any pending
    /// reconnect, stops the event pump, and releases the handle. Calling it
    /// for an absent session is a no-op.
    pub async fn remove_handle(&self, session_id: i64, is_logout: bool) {
        self.scheduler.clear(session_id);
        if let Some((_, shutdown)) = self.pump_shutdown.remove(&session_id) {
            shutdown.notify_waiters();
        }
        self.registry.remove(session_id, is_logout).await;
    }

    /// Forcibly tears down and reconnects every session of a tenant. The
    /// reconnects run detached; failures are logged, not propagated.
    pub async fn restart_all_for_tenant(
        self: &Arc<Self>,
        tenant_id: i64,
    ) -> Result<(), WbotError> {
        let sessions = self.store.list_for_tenant(tenant_id).await?;
        info!(
            target: "Wbot/Manager",
            "tenant {tenant_id}: restarting {} session(s)",
            sessions.len()
        );
        for session in sessions {
            let id = session.id;
            self.remove_handle(id, false).await;
            let manager = self.clone();
            tokio::spawn(async move {
                if let Err(e) = manager.start_session(session).await {
                    warn!(target: "Wbot/Manager", "session {id}: restart failed: {e}");
                }
            });
        }
        Ok(())
    }
}
