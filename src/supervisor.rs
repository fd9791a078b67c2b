//! Connection supervisor: the lifecycle state machine for one session's
//! transport connection. Implemented on [`ConnectionManager`] so every
//! per-session table lives in one place; each running session gets its own
//! event pump task consuming the transport's serial event stream.

use crate::creds::CredentialStore;
use crate::error::WbotError;
use crate::fanout::WbotEvent;
use crate::manager::ConnectionManager;
use crate::registry::ConnectionHandle;
use crate::store::SessionUpdate;
use crate::transport::{Transport, TransportConfig, TransportEvent};
use crate::types::{ClosePolicy, CloseReason, Session, SessionStatus, classify};
use crate::version;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Pump-local state for one connection attempt.
struct PumpCtx {
    session_id: i64,
    tenant_id: i64,
    creds: Arc<CredentialStore>,
    transport: Arc<dyn Transport>,
    qr_timer: Option<JoinHandle<()>>,
    side_task: Option<JoinHandle<()>>,
    open_tx: Option<oneshot::Sender<Result<Arc<ConnectionHandle>, WbotError>>>,
}

impl ConnectionManager {
    /// Begins a connect attempt for the session. The future resolves once
    /// the connection reaches `CONNECTED`, and rejects on unrecoverable
    /// setup failure or when the connection dies before becoming ready.
    ///
    /// Precondition: no live handle is registered for this id; callers must
    /// remove a stale handle first.
    pub async fn start_session(
        self: &Arc<Self>,
        session: Session,
    ) -> Result<Arc<ConnectionHandle>, WbotError> {
        let session_id = session.id;
        if self.connecting.insert(session_id, ()).is_some() {
            return Err(WbotError::AlreadyConnected(session_id));
        }
        let _guard = scopeguard::guard(self.clone(), move |manager| {
            manager.connecting.remove(&session_id);
        });

        if self.registry.contains(session_id) {
            return Err(WbotError::AlreadyConnected(session_id));
        }

        info!(target: "Wbot/Supervisor", "session {session_id}: starting connect attempt");
        let creds = Arc::new(CredentialStore::load(&session, self.store.clone()).await?);
        let resolved_version = version::resolve(
            self.version_provider.as_ref(),
            self.config.version_override,
        )
        .await;

        let transport_config = TransportConfig {
            version: resolved_version,
            auth: creds.clone(),
            browser: self.config.browser.clone(),
            connect_timeout: self.config.connect_timeout,
            keepalive_interval: self.config.keepalive_interval,
            ignore_jid: self.config.ignore_jid.clone(),
            message_retry_cache: self.config.message_retry_cache.clone(),
        };
        let (transport, events) = self
            .factory
            .create(transport_config)
            .await
            .map_err(|e| WbotError::Transport(e.to_string()))?;

        // Replace any pump left over from a previous connection attempt.
        let shutdown = Arc::new(Notify::new());
        if let Some(stale) = self.pump_shutdown.insert(session_id, shutdown.clone()) {
            stale.notify_waiters();
        }

        let (open_tx, open_rx) = oneshot::channel();
        let manager = self.clone();
        let ctx = PumpCtx {
            session_id,
            tenant_id: session.tenant_id,
            creds,
            transport,
            qr_timer: None,
            side_task: None,
            open_tx: Some(open_tx),
        };
        tokio::spawn(async move {
            manager.run_event_pump(ctx, events, shutdown).await;
        });

        match open_rx.await {
            Ok(result) => result,
            Err(_) => Err(WbotError::ClosedBeforeOpen(
                session_id,
                "event pump stopped".to_string(),
            )),
        }
    }

    /// Re-reads the session row and starts it again. This is the action the
    /// reconnect scheduler fires; every failure path here is logged and, if
    /// transient, rescheduled rather than propagated.
    pub async fn restart_session(self: &Arc<Self>, session_id: i64) {
        let session = match self.store.get(session_id).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                warn!(target: "Wbot/Supervisor", "session {session_id}: gone from storage, not restarting");
                return;
            }
            Err(e) => {
                warn!(target: "Wbot/Supervisor", "session {session_id}: storage read failed, retrying later: {e}");
                self.schedule_restart(session_id, Duration::ZERO, "storage read failed");
                return;
            }
        };

        // Drop any stale handle left from the previous connection.
        self.registry.remove(session_id, false).await;

        match self.start_session(session).await {
            Ok(_) => info!(target: "Wbot/Supervisor", "session {session_id}: reconnected"),
            Err(WbotError::Transport(e)) => {
                warn!(target: "Wbot/Supervisor", "session {session_id}: connect attempt failed: {e}");
                self.schedule_restart(session_id, Duration::ZERO, "connect attempt failed");
            }
            Err(WbotError::AlreadyConnected(_)) => {
                debug!(target: "Wbot/Supervisor", "session {session_id}: already connecting, restart skipped");
            }
            Err(e) => {
                // Terminal outcomes (logout, malformed blob) were already
                // handled by the close path; do not fight its decision.
                warn!(target: "Wbot/Supervisor", "session {session_id}: restart abandoned: {e}");
            }
        }
    }

    /// Reports a key-integrity failure observed outside the close event,
    /// e.g. while decrypting a message. Below the threshold the session is
    /// bounced without touching credentials; at the threshold the keys are
    /// considered corrupted and wiped.
    pub async fn record_key_error(self: &Arc<Self>, session_id: i64) {
        let now = Instant::now();
        let count = {
            let mut window = self.key_errors.entry(session_id).or_default();
            window.push_back(now);
            while let Some(first) = window.front() {
                if now.duration_since(*first) > self.config.key_error_window {
                    window.pop_front();
                } else {
                    break;
                }
            }
            window.len() as u32
        };

        if count < self.config.key_error_threshold {
            warn!(
                target: "Wbot/Supervisor",
                "session {session_id}: key error {count}/{} in window, reconnecting without wipe",
                self.config.key_error_threshold
            );
            self.remove_handle(session_id, false).await;
            self.schedule_restart(session_id, Duration::ZERO, "key error");
            return;
        }

        warn!(
            target: "Wbot/Supervisor",
            "session {session_id}: {count} key errors in window, wiping credentials"
        );
        self.key_errors.remove(&session_id);
        self.remove_handle(session_id, false).await;
        if let Ok(Some(session)) = self.store.get(session_id).await {
            self.reset_session_row(session_id, session.tenant_id).await;
        }
        self.schedule_restart(
            session_id,
            self.config.key_reset_delay,
            "repeated key errors",
        );
    }

    pub(crate) fn schedule_restart(self: &Arc<Self>, session_id: i64, min_delay: Duration, reason: &str) {
        let manager = self.clone();
        self.scheduler.schedule(session_id, min_delay, reason, async move {
            manager.restart_session(session_id).await;
        });
    }

    async fn run_event_pump(
        self: Arc<Self>,
        mut ctx: PumpCtx,
        mut events: mpsc::Receiver<TransportEvent>,
        shutdown: Arc<Notify>,
    ) {
        debug!(target: "Wbot/Supervisor", "session {}: event pump started", ctx.session_id);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.notified() => {
                    debug!(target: "Wbot/Supervisor", "session {}: shutdown signaled, stopping pump", ctx.session_id);
                    break;
                }
                event = events.recv() => {
                    match event {
                        Some(TransportEvent::CredsUpdated(patch)) => ctx.creds.set(patch).await,
                        Some(TransportEvent::QrIssued { code }) => self.handle_qr(&mut ctx, code).await,
                        Some(TransportEvent::ConnectionOpen) => self.handle_open(&mut ctx).await,
                        Some(TransportEvent::ConnectionClosed { reason }) => {
                            self.handle_close(&mut ctx, reason).await;
                            break;
                        }
                        Some(TransportEvent::MessageUpsert { payload }) => {
                            self.bus
                                .dispatch(&WbotEvent::MessageReceived {
                                    session_id: ctx.session_id,
                                    tenant_id: ctx.tenant_id,
                                    payload,
                                })
                                .await;
                        }
                        None => {
                            debug!(target: "Wbot/Supervisor", "session {}: event stream ended", ctx.session_id);
                            break;
                        }
                    }
                }
            }
        }
        if let Some(timer) = ctx.qr_timer.take() {
            timer.abort();
        }
        if let Some(task) = ctx.side_task.take() {
            task.abort();
        }
        debug!(target: "Wbot/Supervisor", "session {}: event pump stopped", ctx.session_id);
    }

    async fn handle_qr(self: &Arc<Self>, ctx: &mut PumpCtx, code: String) {
        info!(target: "Wbot/Supervisor", "session {}: QR code issued", ctx.session_id);
        // Always cancel the previous timer before arming a new one.
        if let Some(timer) = ctx.qr_timer.take() {
            timer.abort();
        }

        self.apply_session_update(
            ctx.session_id,
            ctx.tenant_id,
            SessionStatus::Qrcode,
            Some(code.clone()),
            SessionUpdate::new()
                .status(SessionStatus::Qrcode)
                .qr(Some(code)),
        )
        .await;

        let manager = self.clone();
        let session_id = ctx.session_id;
        let qr_timeout = self.config.qr_timeout;
        ctx.qr_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(qr_timeout).await;
            // Detached so pump teardown aborting this timer cannot cancel
            // the recovery half-way through.
            tokio::spawn(async move {
                manager.handle_qr_expiry(session_id).await;
            });
        }));
    }

    async fn handle_qr_expiry(self: Arc<Self>, session_id: i64) {
        match self.store.get(session_id).await {
            Ok(Some(session)) if session.status == SessionStatus::Qrcode => {
                warn!(target: "Wbot/Supervisor", "session {session_id}: QR code expired without being scanned");
                if let Some((_, shutdown)) = self.pump_shutdown.remove(&session_id) {
                    shutdown.notify_waiters();
                }
                self.registry.remove(session_id, false).await;
                self.schedule_restart(session_id, Duration::ZERO, "qr code expired");
            }
            Ok(_) => {
                debug!(target: "Wbot/Supervisor", "session {session_id}: QR timer fired but session moved on");
            }
            Err(e) => {
                warn!(target: "Wbot/Supervisor", "session {session_id}: QR expiry check failed: {e}");
            }
        }
    }

    async fn handle_open(self: &Arc<Self>, ctx: &mut PumpCtx) {
        info!(target: "Wbot/Supervisor", "session {}: connection open", ctx.session_id);
        if let Some(timer) = ctx.qr_timer.take() {
            timer.abort();
        }

        // A successful connection resets every retry counter.
        self.scheduler.clear(ctx.session_id);
        self.rate_limit_attempts.remove(&ctx.session_id);
        self.key_errors.remove(&ctx.session_id);

        // Swap the handle in: remove the stale entry first, the registry
        // never replaces implicitly.
        self.registry.remove(ctx.session_id, false).await;
        let handle = Arc::new(ConnectionHandle::new(
            ctx.session_id,
            Some(ctx.tenant_id),
            ctx.transport.clone(),
        ));
        if let Err(e) = self.registry.insert(handle.clone()) {
            error!(target: "Wbot/Supervisor", "session {}: registry insert failed: {e}", ctx.session_id);
        }

        self.apply_session_update(
            ctx.session_id,
            ctx.tenant_id,
            SessionStatus::Connected,
            None,
            SessionUpdate::new().status(SessionStatus::Connected).qr(None),
        )
        .await;

        // Contact import runs detached: its failures and its duration must
        // not affect connection state. It is aborted if the session drops
        // before it completes.
        let session_id = ctx.session_id;
        let import_handle = handle.clone();
        ctx.side_task = Some(tokio::spawn(async move {
            match import_handle.transport.fetch_contacts().await {
                Ok(contacts) => {
                    let count = contacts.len();
                    for contact in contacts {
                        import_handle.contacts.insert(contact.jid.clone(), contact);
                    }
                    debug!(target: "Wbot/Supervisor", "session {session_id}: imported {count} contact(s)");
                }
                Err(e) => {
                    warn!(target: "Wbot/Supervisor", "session {session_id}: contact import failed: {e}");
                }
            }
        }));

        if let Some(open_tx) = ctx.open_tx.take() {
            let _ = open_tx.send(Ok(handle));
        }
    }

    async fn handle_close(self: &Arc<Self>, ctx: &mut PumpCtx, reason: CloseReason) {
        if let Some(timer) = ctx.qr_timer.take() {
            timer.abort();
        }
        let session_id = ctx.session_id;
        let policy = classify(&reason);
        warn!(
            target: "Wbot/Supervisor",
            "session {session_id}: connection closed ({reason}), policy {policy:?}"
        );
        if let Some(open_tx) = ctx.open_tx.take() {
            let _ = open_tx.send(Err(WbotError::ClosedBeforeOpen(
                session_id,
                reason.to_string(),
            )));
        }

        match policy {
            ClosePolicy::Replaced => {
                // Another process owns this session now; stand down.
                self.scheduler.clear(session_id);
                self.registry.remove(session_id, false).await;
                self.apply_session_update(
                    session_id,
                    ctx.tenant_id,
                    SessionStatus::Disconnected,
                    None,
                    SessionUpdate::new()
                        .status(SessionStatus::Disconnected)
                        .qr(None),
                )
                .await;
            }
            ClosePolicy::LoggedOutIntentional => {
                self.scheduler.clear(session_id);
                self.registry.remove(session_id, false).await;
                self.apply_session_update(
                    session_id,
                    ctx.tenant_id,
                    SessionStatus::Disconnected,
                    None,
                    SessionUpdate::new()
                        .status(SessionStatus::Disconnected)
                        .qr(None),
                )
                .await;
            }
            ClosePolicy::LoggedOutRemote => {
                // The phone revoked this device: wipe and wait for a new
                // pairing, never reconnect on our own.
                self.scheduler.clear(session_id);
                self.registry.remove(session_id, false).await;
                ctx.creds.reset().await;
                self.reset_session_row(session_id, ctx.tenant_id).await;
            }
            ClosePolicy::KeyIntegrity => {
                self.registry.remove(session_id, false).await;
                ctx.creds.reset().await;
                self.reset_session_row(session_id, ctx.tenant_id).await;
                self.schedule_restart(
                    session_id,
                    self.config.key_reset_delay,
                    "key integrity failure",
                );
            }
            ClosePolicy::StreamFault => {
                // Keys are fine and the account is valid; linear backoff.
                self.registry.remove(session_id, false).await;
                let attempts = self.scheduler.attempts(session_id);
                let delay = (self.config.stream_fault_base * (attempts + 1))
                    .min(self.config.stream_fault_cap);
                self.schedule_restart(session_id, delay, "stream fault");
            }
            ClosePolicy::RateLimited => {
                let strikes = {
                    let mut counter = self.rate_limit_attempts.entry(session_id).or_insert(0);
                    *counter += 1;
                    *counter
                };
                self.registry.remove(session_id, false).await;
                if strikes <= self.config.rate_limit_max {
                    let delay = self.config.rate_limit_delays
                        [(strikes as usize - 1).min(self.config.rate_limit_delays.len() - 1)];
                    self.schedule_restart(session_id, delay, "rate limited");
                } else {
                    warn!(
                        target: "Wbot/Supervisor",
                        "session {session_id}: rate limited {strikes} times, resetting credentials"
                    );
                    self.rate_limit_attempts.remove(&session_id);
                    ctx.creds.reset().await;
                    self.apply_session_update(
                        session_id,
                        ctx.tenant_id,
                        SessionStatus::Pending,
                        None,
                        SessionUpdate::new()
                            .status(SessionStatus::Pending)
                            .credential_blob(None)
                            .qr(None),
                    )
                    .await;
                    self.schedule_restart(session_id, Duration::ZERO, "rate limit reset");
                }
            }
            ClosePolicy::Transient => {
                self.registry.remove(session_id, false).await;
                self.schedule_restart(session_id, Duration::ZERO, "transient close");
            }
        }
    }

    /// Persists a status transition (best-effort) and fans it out.
    pub(crate) async fn apply_session_update(
        &self,
        session_id: i64,
        tenant_id: i64,
        status: SessionStatus,
        qr: Option<String>,
        update: SessionUpdate,
    ) {
        if let Err(e) = self.store.update(session_id, update).await {
            warn!(
                target: "Wbot/Supervisor",
                "session {session_id}: failed to persist status {status}: {e}"
            );
        }
        self.bus
            .dispatch(&WbotEvent::SessionStatus {
                session_id,
                tenant_id,
                status,
                qr,
            })
            .await;
    }

    /// Full reset after a credential wipe: the row survives, its fields are
    /// cleared and the session requires a fresh QR pairing.
    async fn reset_session_row(&self, session_id: i64, tenant_id: i64) {
        self.apply_session_update(
            session_id,
            tenant_id,
            SessionStatus::Disconnected,
            None,
            SessionUpdate::new()
                .status(SessionStatus::Disconnected)
                .credential_blob(None)
                .qr(None)
                .number(None),
        )
        .await;
    }
}
