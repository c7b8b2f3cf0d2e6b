//! Session connection core
//!
//! [`SessionManager`] owns the connection lifecycle of every session: it
//! opens transports, turns their events into store transitions and
//! broadcasts, schedules reconnects and tears sessions down. Everything that
//! touches one session runs under that session's registry slot lock, so a
//! session's transitions are applied one at a time and in order.

use super::registry::{Phase, RegistryStats, SessionRegistry, SessionSlot, SlotState};
use super::retry::{ArmOutcome, RetryFuture, RetryPolicy, RetryScheduler};
use super::state::{validate_session_id, SessionPatch, SessionStatus, StatusChange};
use super::store::SessionStore;
use crate::audit::AuditLog;
use crate::broadcast::{EventBroadcaster, GatewayEvent};
use crate::config::schema::Config;
use crate::error::{TetherError, TetherResult};
use crate::transport::{
    Disconnect, DisconnectReason, PairingMode, Transport, TransportEvent, TransportSession,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const DISCONNECTED_BY_REQUEST: &str = "Disconnected by request";
const NO_CREDENTIALS: &str = "No credentials found";
const GATEWAY_STOPPED: &str = "Gateway stopped";

fn exhausted_detail(attempts: u32) -> String {
    format!("Reconnection stopped: max attempts ({attempts}) reached")
}

/// Tunables for the connection core
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub retry: RetryPolicy,
    pub connect_timeout: Duration,
    pub audit: AuditLog,
}

impl ManagerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            retry: RetryPolicy::from(&config.retry),
            connect_timeout: Duration::from_secs(config.transport.connect_timeout_secs),
            audit: AuditLog::new(config),
        }
    }
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            connect_timeout: Duration::from_secs(60),
            audit: AuditLog::disabled(),
        }
    }
}

/// Drives session connections against a transport
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn SessionStore>,
    transport: Arc<dyn Transport>,
    broadcaster: EventBroadcaster,
    registry: SessionRegistry,
    retry: RetryScheduler,
    audit: AuditLog,
    connect_timeout: Duration,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        transport: Arc<dyn Transport>,
        broadcaster: EventBroadcaster,
        options: ManagerOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                transport,
                broadcaster,
                registry: SessionRegistry::new(),
                retry: RetryScheduler::new(options.retry),
                audit: options.audit,
                connect_timeout: options.connect_timeout,
            }),
        }
    }

    /// Start connecting a session.
    ///
    /// Returns once the attempt is scheduled; progress arrives as broadcast
    /// events. A session that is already connecting or connected is left
    /// alone. Connecting a deleted ID starts a fresh session under it.
    pub async fn connect(&self, session_id: &str, pairing: PairingMode) -> TetherResult<()> {
        validate_session_id(session_id)?;
        let inner = &self.inner;
        // Surface an unreachable store to the caller
        inner.store.find_by_id(session_id).await?;

        let (slot, mut state) = inner.registry.acquire(session_id).await;
        if state.is_claimed() {
            debug!(session_id, event = "connect-locked", "Connection already in progress");
            return Ok(());
        }

        inner.retry.reset(&mut state);
        state.pairing = pairing;
        let generation = state.begin_connect();
        drop(state);

        inner.spawn_connection(session_id.to_string(), slot, generation);
        Ok(())
    }

    /// Delete a session: close its connection, cancel its reconnect, remove
    /// its row and notify subscribers. Deleting an unknown session does
    /// nothing.
    pub async fn delete(&self, session_id: &str) -> TetherResult<()> {
        validate_session_id(session_id)?;
        let inner = &self.inner;
        let (slot, mut state) = inner.registry.acquire(session_id).await;

        let existed = match inner.store.delete(session_id).await {
            Ok(existed) => existed,
            Err(e) => {
                inner.registry.prune(session_id, &slot, &mut state);
                return Err(e);
            }
        };
        let tracked = state.generation > 0 || state.retry.is_some();
        let cancelled_retry = state.retry.is_some();
        inner.retry.reset(&mut state);
        if let Some(link) = state.invalidate() {
            link.close().await;
        }
        inner.registry.retire(session_id, &slot, &mut state);
        drop(state);

        if !existed && !tracked {
            debug!(session_id, "Nothing to delete");
            return Ok(());
        }

        inner.broadcaster.publish(GatewayEvent::SessionDeleted {
            session_id: session_id.to_string(),
        });
        info!(session_id, existed, cancelled_retry, event = "session-deleted", "Session deleted");
        inner
            .audit
            .record("session.deleted", session_id, json!({ "existed": existed }))
            .await;
        Ok(())
    }

    /// Close a session's connection without reconnecting; its row is kept
    pub async fn disconnect(&self, session_id: &str) -> TetherResult<()> {
        validate_session_id(session_id)?;
        let inner = &self.inner;
        let (slot, mut state) = inner.registry.acquire(session_id).await;

        inner.retry.reset(&mut state);
        if let Some(link) = state.invalidate() {
            link.close().await;
        }
        let result = inner
            .apply_to_existing(session_id, StatusChange::disconnected(DISCONNECTED_BY_REQUEST))
            .await;
        inner.registry.retire(session_id, &slot, &mut state);
        drop(state);

        if result?.is_some() {
            info!(session_id, event = "session-disconnected", "Session disconnected");
            inner
                .audit
                .record("session.disconnected", session_id, json!({}))
                .await;
        }
        Ok(())
    }

    /// Current view of every stored session.
    ///
    /// A row that says `CONNECTED` without a live connection in this process
    /// is reported as `DISCONNECTED`.
    pub async fn sessions(&self) -> TetherResult<Vec<SessionPatch>> {
        let rows = self.inner.store.list().await?;
        let mut out = Vec::with_capacity(rows.len());
        for mut row in rows {
            if row.is_connected() && !self.inner.registry.is_live(&row.id).await {
                row.status = SessionStatus::Disconnected;
            }
            out.push(SessionPatch::snapshot(&row, row.is_connected()));
        }
        Ok(out)
    }

    /// Reconnect every stored session that holds credentials, pausing
    /// `stagger` between them. Returns how many were started.
    pub async fn restore(&self, stagger: Duration) -> TetherResult<usize> {
        let inner = &self.inner;
        let rows = inner.store.list().await?;
        let mut restored = 0;

        for row in rows {
            if row.token.is_none() {
                if row.is_connected() {
                    let (slot, mut state) = inner.registry.acquire(&row.id).await;
                    let result = if state.is_idle() {
                        inner
                            .apply_to_existing(&row.id, StatusChange::disconnected(NO_CREDENTIALS))
                            .await
                    } else {
                        Ok(None)
                    };
                    inner.registry.prune(&row.id, &slot, &mut state);
                    result?;
                }
                continue;
            }

            if restored > 0 && !stagger.is_zero() {
                tokio::time::sleep(stagger).await;
            }
            match self.connect(&row.id, PairingMode::Qr).await {
                Ok(()) => restored += 1,
                Err(e) => warn!(session_id = %row.id, error = %e, "Failed to restore session"),
            }
        }

        info!(restored, "Restored sessions");
        Ok(restored)
    }

    /// Count one disconnect for an idle session and schedule a reconnect
    pub async fn arm_retry(&self, session_id: &str) -> TetherResult<ArmOutcome> {
        validate_session_id(session_id)?;
        let inner = &self.inner;
        let (slot, mut state) = inner.registry.acquire(session_id).await;
        if state.is_claimed() {
            return Ok(ArmOutcome::Suppressed);
        }

        let outcome = inner.arm(session_id, &slot, &mut state);
        if let ArmOutcome::Exhausted { attempts } = outcome {
            inner.exhaust(session_id, &slot, &mut state, attempts).await;
        }
        Ok(outcome)
    }

    /// Cancel a pending reconnect; returns whether one was pending
    pub async fn cancel_retry(&self, session_id: &str) -> bool {
        let inner = &self.inner;
        let Some((slot, mut state)) = inner.registry.acquire_existing(session_id).await else {
            return false;
        };
        let cancelled = inner.retry.cancel(&mut state);
        if cancelled {
            debug!(session_id, "Reconnect cancelled");
        }
        inner.registry.prune(session_id, &slot, &mut state);
        cancelled
    }

    /// Close every connection and cancel every pending reconnect.
    ///
    /// Sessions that were connecting, connected or waiting to reconnect are
    /// marked `DISCONNECTED`; their credentials are kept for the next
    /// restore. Returns how many open connections were closed.
    pub async fn shutdown(&self) -> usize {
        let inner = &self.inner;
        let mut closed = 0;

        for (id, slot) in inner.registry.entries() {
            let mut state = slot.lock().await;
            if state.retired {
                continue;
            }
            let active = !state.is_idle();
            inner.retry.reset(&mut state);
            if let Some(link) = state.invalidate() {
                link.close().await;
                closed += 1;
            }
            if active {
                if let Err(e) = inner
                    .apply_to_existing(&id, StatusChange::disconnected(GATEWAY_STOPPED))
                    .await
                {
                    error!(session_id = %id, error = %e, "Failed to record shutdown");
                }
            }
            inner.registry.retire(&id, &slot, &mut state);
        }

        info!(closed, event = "shutdown", "Closed all sessions");
        closed
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.inner.broadcaster.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.broadcaster.subscriber_count()
    }

    pub async fn stats(&self) -> RegistryStats {
        self.inner.registry.stats().await
    }

    /// Consecutive disconnects in the session's current episode
    pub async fn attempts(&self, session_id: &str) -> u32 {
        self.inner.registry.attempts(session_id).await
    }

    pub async fn is_live(&self, session_id: &str) -> bool {
        self.inner.registry.is_live(session_id).await
    }
}

impl Inner {
    fn spawn_connection(self: &Arc<Self>, session_id: String, slot: Arc<SessionSlot>, generation: u64) {
        tokio::spawn(Arc::clone(self).run_connection(session_id, slot, generation));
    }

    /// One connection attempt, from `INIT` until the connection closes
    async fn run_connection(self: Arc<Self>, session_id: String, slot: Arc<SessionSlot>, generation: u64) {
        let id = session_id.as_str();

        let (pairing, attempt) = {
            let mut state = slot.lock().await;
            if !state.owns(generation) {
                debug!(session_id = id, event = "reconnect-superseded", "Connection attempt superseded");
                return;
            }
            info!(
                session_id = id,
                attempt = state.attempts,
                transport = self.transport.name(),
                event = "connect-start",
                "Connecting session"
            );
            if let Err(e) = self.apply_change(id, StatusChange::init()).await {
                error!(session_id = id, error = %e, "Failed to record session start");
                state.release();
                self.registry.prune(id, &slot, &mut state);
                return;
            }
            (state.pairing.clone(), state.attempts)
        };

        let opened = tokio::time::timeout(self.connect_timeout, self.transport.open(id, &pairing)).await;
        let TransportSession { link, mut events } = match opened {
            Ok(Ok(session)) => session,
            Ok(Err(e)) if e.is_retryable() => {
                warn!(session_id = id, attempt, error = %e, event = "connect-failed", "Failed to open transport");
                let disconnect = Disconnect::connection_lost(format!("Connection failed: {e}"));
                self.on_disconnect(id, &slot, generation, disconnect).await;
                return;
            }
            Ok(Err(e)) => {
                error!(session_id = id, attempt, error = %e, event = "connect-failed", "Transport rejected session, not reconnecting");
                self.abandon(id, &slot, generation, format!("Connection failed: {e}"))
                    .await;
                return;
            }
            Err(_) => {
                let err = TetherError::TransportTimeout {
                    secs: self.connect_timeout.as_secs(),
                };
                warn!(session_id = id, attempt, error = %err, event = "connect-timeout", "Transport open timed out");
                let disconnect = Disconnect::new(DisconnectReason::TimedOut, err.to_string());
                self.on_disconnect(id, &slot, generation, disconnect).await;
                return;
            }
        };

        {
            let mut state = slot.lock().await;
            if !state.owns(generation) {
                debug!(session_id = id, "Session changed while connecting, closing new connection");
                link.close().await;
                return;
            }
            state.phase = Phase::Live(link);
        }

        while let Some(event) = events.recv().await {
            if !self.on_event(id, &slot, generation, event).await {
                return;
            }
        }

        let disconnect = Disconnect::connection_lost("Connection dropped");
        self.on_disconnect(id, &slot, generation, disconnect).await;
    }

    /// Apply one transport event; returns false once the connection is over
    async fn on_event(
        self: &Arc<Self>,
        id: &str,
        slot: &Arc<SessionSlot>,
        generation: u64,
        event: TransportEvent,
    ) -> bool {
        let mut state = slot.lock().await;
        if !state.owns(generation) {
            debug!(session_id = id, "Dropping event from superseded connection");
            return false;
        }

        let result = match event {
            TransportEvent::Qr(data) => {
                debug!(session_id = id, event = "qr", "QR code received");
                self.apply_change(id, StatusChange::qr(data)).await.map(|_| ())
            }
            TransportEvent::PairingCode(code) => {
                info!(session_id = id, event = "pairing-code", "Pairing code received");
                self.apply_change(id, StatusChange::pairing_code(code))
                    .await
                    .map(|_| ())
            }
            TransportEvent::Open { display_name } => {
                self.on_open(id, &mut state, display_name).await
            }
            TransportEvent::Message(message) => {
                self.broadcaster.publish(GatewayEvent::Message {
                    session_id: id.to_string(),
                    message,
                });
                Ok(())
            }
            TransportEvent::Closed(disconnect) => {
                self.handle_disconnect(id, slot, &mut state, disconnect).await;
                return false;
            }
        };

        if let Err(e) = result {
            error!(session_id = id, error = %e, "Failed to record session event");
        }
        true
    }

    async fn on_open(
        &self,
        id: &str,
        state: &mut SlotState,
        display_name: Option<String>,
    ) -> TetherResult<()> {
        let previous_attempts = state.attempts;
        self.retry.reset(state);

        let detail = format!(
            "Connected as {}",
            display_name.as_deref().unwrap_or("unknown account")
        );
        let patch = self
            .apply_change(id, StatusChange::connected(detail.clone()))
            .await?;

        if patch.is_some_and(|p| p.status.is_some()) {
            info!(session_id = id, previous_attempts, event = "open", "Session connected");
            self.audit
                .record("session.connected", id, json!({ "detail": detail }))
                .await;
        } else {
            debug!(session_id = id, event = "open", "Session already connected");
        }
        Ok(())
    }

    async fn on_disconnect(
        self: &Arc<Self>,
        id: &str,
        slot: &Arc<SessionSlot>,
        generation: u64,
        disconnect: Disconnect,
    ) {
        let mut state = slot.lock().await;
        if !state.owns(generation) {
            debug!(session_id = id, event = "close", "Ignoring close from superseded connection");
            return;
        }
        self.handle_disconnect(id, slot, &mut state, disconnect).await;
    }

    /// Release the slot, record the close and decide whether to reconnect.
    /// The caller has checked that the connection is still current.
    async fn handle_disconnect(
        self: &Arc<Self>,
        id: &str,
        slot: &Arc<SessionSlot>,
        state: &mut SlotState,
        disconnect: Disconnect,
    ) {
        if let Some(link) = state.release() {
            link.close().await;
        }
        info!(
            session_id = id,
            reason = %disconnect.reason,
            detail = %disconnect.detail,
            event = "close",
            "Session connection closed"
        );

        if !disconnect.reason.is_retryable() {
            self.retry.reset(state);
            warn!(session_id = id, reason = %disconnect.reason, event = "logged-out", "Session logged out, not reconnecting");
            let change = StatusChange::disconnected(disconnect.detail.clone()).revoke_credentials();
            self.record(id, change).await;
            self.audit
                .record(
                    "session.logged_out",
                    id,
                    json!({ "reason": disconnect.reason.as_str(), "detail": disconnect.detail }),
                )
                .await;
            self.registry.prune(id, slot, state);
            return;
        }

        let detail = match self.arm(id, slot, state) {
            ArmOutcome::Scheduled { attempt, delay } => {
                info!(
                    session_id = id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    event = "reconnect-scheduled",
                    "Reconnect scheduled"
                );
                format!(
                    "{} (reconnecting, attempt {}/{})",
                    disconnect.detail,
                    attempt,
                    self.retry.policy().max_attempts
                )
            }
            ArmOutcome::Exhausted { attempts } => {
                self.exhaust(id, slot, state, attempts).await;
                return;
            }
            ArmOutcome::AlreadyPending | ArmOutcome::Suppressed => disconnect.detail,
        };
        self.record(id, StatusChange::disconnected(detail)).await;
    }

    /// End an attempt for good after an error a reconnect cannot fix
    async fn abandon(&self, id: &str, slot: &Arc<SessionSlot>, generation: u64, detail: String) {
        let mut state = slot.lock().await;
        if !state.owns(generation) {
            return;
        }
        state.release();
        self.retry.reset(&mut state);
        self.record(id, StatusChange::disconnected(detail)).await;
        self.registry.prune(id, slot, &mut state);
    }

    fn arm(self: &Arc<Self>, id: &str, slot: &Arc<SessionSlot>, state: &mut SlotState) -> ArmOutcome {
        let inner = Arc::clone(self);
        let slot = Arc::clone(slot);
        let session_id = id.to_string();
        self.retry
            .arm(id, state, move |ticket| inner.fire_retry(session_id, slot, ticket))
    }

    /// Timer body: start the next attempt unless the timer was superseded
    fn fire_retry(self: Arc<Self>, session_id: String, slot: Arc<SessionSlot>, ticket: u64) -> RetryFuture {
        Box::pin(async move {
            let mut state = slot.lock().await;
            let attempt = match state.retry.as_ref() {
                Some(pending) if pending.ticket == ticket => pending.attempt,
                _ => {
                    debug!(session_id = %session_id, event = "reconnect-superseded", "Stale reconnect timer");
                    return;
                }
            };
            // This task is the timer; clearing it must not abort it
            state.retry = None;

            if state.retired || state.is_claimed() {
                debug!(session_id = %session_id, event = "reconnect-superseded", "Reconnect no longer needed");
                return;
            }

            info!(session_id = %session_id, attempt, event = "reconnect-attempt", "Reconnecting session");
            let generation = state.begin_connect();
            drop(state);
            self.run_connection(session_id, slot, generation).await;
        })
    }

    async fn exhaust(&self, id: &str, slot: &Arc<SessionSlot>, state: &mut SlotState, attempts: u32) {
        warn!(session_id = id, attempts, event = "reconnect-max-reached", "Giving up on session");
        self.record(id, StatusChange::disconnected(exhausted_detail(attempts)))
            .await;
        self.audit
            .record("session.retry_exhausted", id, json!({ "attempts": attempts }))
            .await;
        self.registry.prune(id, slot, state);
    }

    /// Write a transition and broadcast what changed, creating the row if
    /// it is missing. Returns the published patch, if any.
    async fn apply_change(&self, id: &str, change: StatusChange) -> TetherResult<Option<SessionPatch>> {
        let before = self.store.find_by_id(id).await?;
        if before.is_none() {
            self.store.create(id).await?;
        }
        let after = self.store.update_status(id, &change).await?;

        let patch = SessionPatch::diff(before.as_ref(), &after);
        if let Some(patch) = &patch {
            self.broadcaster
                .publish(GatewayEvent::SessionUpdate(vec![patch.clone()]));
        }
        Ok(patch)
    }

    /// Like [`Inner::apply_change`] but leaves missing rows missing
    async fn apply_to_existing(
        &self,
        id: &str,
        change: StatusChange,
    ) -> TetherResult<Option<SessionPatch>> {
        if self.store.find_by_id(id).await?.is_none() {
            return Ok(None);
        }
        self.apply_change(id, change).await
    }

    /// Apply a transition from a background task, logging failures
    async fn record(&self, id: &str, change: StatusChange) {
        if let Err(e) = self.apply_change(id, change).await {
            error!(session_id = id, error = %e, "Failed to record session transition");
        }
    }
}
