//! Per-session registry
//!
//! One [`SessionSlot`] per session ID holds everything the connection core
//! tracks in memory: the live connection, the retry counter and timer. Each
//! slot has its own async mutex, which is the serialization point for that
//! session; different sessions never contend.
//!
//! Slots only live in the map while they hold something. Once a session is
//! deleted, disconnected or stopped for good its slot is retired: removed
//! from the map under its own lock and flagged, so tasks still holding the
//! old slot see that it no longer speaks for the session.

use crate::transport::{Link, PairingMode};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

/// Connection phase of a slot
pub(crate) enum Phase {
    /// No connection and none being opened
    Idle,
    /// A connection attempt is in flight
    Connecting,
    /// A connection is open
    Live(Box<dyn Link>),
}

/// A scheduled reconnect
pub(crate) struct PendingRetry {
    pub ticket: u64,
    pub attempt: u32,
    pub handle: JoinHandle<()>,
}

/// In-memory state of one session
pub(crate) struct SlotState {
    /// Bumped whenever a connection attempt starts or is invalidated;
    /// events from older generations are discarded
    pub generation: u64,
    pub phase: Phase,
    pub pairing: PairingMode,
    /// Consecutive disconnects in the current episode
    pub attempts: u32,
    pub retry: Option<PendingRetry>,
    pub retry_seq: u64,
    /// Removed from the registry; a later operation on the same ID gets a
    /// fresh slot
    pub retired: bool,
}

impl SlotState {
    fn new() -> Self {
        Self {
            generation: 0,
            phase: Phase::Idle,
            pairing: PairingMode::default(),
            attempts: 0,
            retry: None,
            retry_seq: 0,
            retired: false,
        }
    }

    /// Whether a connection is open or being opened
    pub fn is_claimed(&self) -> bool {
        !matches!(self.phase, Phase::Idle)
    }

    pub fn is_live(&self) -> bool {
        matches!(self.phase, Phase::Live(_))
    }

    /// No connection and no pending reconnect
    pub fn is_idle(&self) -> bool {
        !self.is_claimed() && self.retry.is_none()
    }

    /// Whether events from connection `generation` may still take effect
    pub fn owns(&self, generation: u64) -> bool {
        self.generation == generation && !self.retired
    }

    /// Claim the slot for a new connection attempt
    pub fn begin_connect(&mut self) -> u64 {
        self.generation += 1;
        self.phase = Phase::Connecting;
        self.generation
    }

    /// Invalidate the current connection and release the slot,
    /// returning the link to close if one was open
    pub fn invalidate(&mut self) -> Option<Box<dyn Link>> {
        self.generation += 1;
        self.release()
    }

    /// Release the slot, returning the link if one was open
    pub fn release(&mut self) -> Option<Box<dyn Link>> {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Live(link) => Some(link),
            Phase::Idle | Phase::Connecting => None,
        }
    }
}

/// Held lock on one slot's state
pub(crate) type SlotGuard = OwnedMutexGuard<SlotState>;

/// Lock-holder for one session
pub(crate) struct SessionSlot {
    state: Arc<Mutex<SlotState>>,
}

impl SessionSlot {
    fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SlotState::new())),
        }
    }

    pub async fn lock(&self) -> SlotGuard {
        Arc::clone(&self.state).lock_owned().await
    }
}

/// Counts across all slots
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub sessions: usize,
    pub connecting: usize,
    pub live: usize,
    pub pending_retries: usize,
}

/// Process-wide map of session ID to slot
#[derive(Default)]
pub(crate) struct SessionRegistry {
    slots: DashMap<String, Arc<SessionSlot>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the slot for a session, creating it if needed
    fn slot(&self, session_id: &str) -> Arc<SessionSlot> {
        if let Some(slot) = self.slots.get(session_id) {
            return Arc::clone(slot.value());
        }
        Arc::clone(
            self.slots
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(SessionSlot::new()))
                .value(),
        )
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<SessionSlot>> {
        self.slots.get(session_id).map(|s| Arc::clone(s.value()))
    }

    /// Lock the current slot for a session, creating it if needed
    pub async fn acquire(&self, session_id: &str) -> (Arc<SessionSlot>, SlotGuard) {
        loop {
            let slot = self.slot(session_id);
            let state = slot.lock().await;
            // Retired slots are already out of the map, so the next lookup
            // finds or creates the current one
            if !state.retired {
                return (slot, state);
            }
        }
    }

    /// Lock the current slot for a session if it has one
    pub async fn acquire_existing(&self, session_id: &str) -> Option<(Arc<SessionSlot>, SlotGuard)> {
        loop {
            let slot = self.get(session_id)?;
            let state = slot.lock().await;
            if !state.retired {
                return Some((slot, state));
            }
        }
    }

    /// Take a slot out of the map. The caller holds its lock.
    pub fn retire(&self, session_id: &str, slot: &Arc<SessionSlot>, state: &mut SlotState) {
        state.retired = true;
        self.slots
            .remove_if(session_id, |_, current| Arc::ptr_eq(current, slot));
    }

    /// Retire the slot if it holds no connection and no pending reconnect
    pub fn prune(&self, session_id: &str, slot: &Arc<SessionSlot>, state: &mut SlotState) -> bool {
        if state.retired || !state.is_idle() {
            return false;
        }
        self.retire(session_id, slot, state);
        true
    }

    /// Snapshot of every slot currently in the map
    pub fn entries(&self) -> Vec<(String, Arc<SessionSlot>)> {
        self.slots
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub async fn is_live(&self, session_id: &str) -> bool {
        match self.get(session_id) {
            Some(slot) => slot.lock().await.is_live(),
            None => false,
        }
    }

    /// Consecutive disconnects recorded for a session
    pub async fn attempts(&self, session_id: &str) -> u32 {
        match self.get(session_id) {
            Some(slot) => slot.lock().await.attempts,
            None => 0,
        }
    }

    pub async fn stats(&self) -> RegistryStats {
        // Collect first so no map shard is held across an await
        let slots = self.entries();

        let mut stats = RegistryStats::default();
        for (_, slot) in slots {
            let state = slot.lock().await;
            if state.retired {
                continue;
            }
            stats.sessions += 1;
            match state.phase {
                Phase::Idle => {}
                Phase::Connecting => stats.connecting += 1,
                Phase::Live(_) => stats.live += 1,
            }
            if state.retry.is_some() {
                stats.pending_retries += 1;
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NoopLink;

    #[async_trait]
    impl Link for NoopLink {
        async fn close(&self) {}
    }

    #[tokio::test]
    async fn slot_is_shared_per_id() {
        let registry = SessionRegistry::new();
        let (a, state) = registry.acquire("s1").await;
        drop(state);
        let (b, _state) = registry.acquire("s1").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert!(registry.get("s2").is_none());
        assert!(registry.acquire_existing("s2").await.is_none());
    }

    #[tokio::test]
    async fn begin_connect_claims_and_bumps_generation() {
        let registry = SessionRegistry::new();
        let (_slot, mut state) = registry.acquire("s1").await;

        assert!(!state.is_claimed());
        let generation = state.begin_connect();
        assert!(state.is_claimed());
        assert!(state.owns(generation));

        assert!(state.invalidate().is_none());
        assert!(!state.owns(generation));
        assert!(!state.is_claimed());
    }

    #[tokio::test]
    async fn retired_slot_leaves_the_map() {
        let registry = SessionRegistry::new();
        let (old, mut state) = registry.acquire("s1").await;
        let generation = state.begin_connect();
        registry.retire("s1", &old, &mut state);
        drop(state);

        assert!(!old.lock().await.owns(generation));
        assert_eq!(registry.len(), 0);

        let (fresh, state) = registry.acquire("s1").await;
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert!(!state.retired);
        assert_eq!(state.generation, 0);
    }

    #[tokio::test]
    async fn waiter_on_retired_slot_gets_the_fresh_one() {
        let registry = Arc::new(SessionRegistry::new());
        let (old, mut state) = registry.acquire("s1").await;

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                let (slot, _state) = registry.acquire("s1").await;
                slot
            })
        };
        tokio::task::yield_now().await;

        registry.retire("s1", &old, &mut state);
        drop(state);

        let seen = waiter.await.unwrap();
        assert!(!Arc::ptr_eq(&old, &seen));
        assert!(Arc::ptr_eq(&seen, &registry.get("s1").unwrap()));
    }

    #[tokio::test]
    async fn prune_keeps_busy_slots() {
        let registry = SessionRegistry::new();
        let (slot, mut state) = registry.acquire("s1").await;
        state.begin_connect();
        assert!(!registry.prune("s1", &slot, &mut state));
        assert_eq!(registry.len(), 1);

        state.release();
        assert!(registry.prune("s1", &slot, &mut state));
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn release_returns_live_link() {
        let registry = SessionRegistry::new();
        let (slot, mut state) = registry.acquire("s1").await;
        state.begin_connect();
        state.phase = Phase::Live(Box::new(NoopLink));
        drop(state);

        assert!(registry.is_live("s1").await);
        let stats = registry.stats().await;
        assert_eq!(stats.live, 1);
        assert_eq!(stats.sessions, 1);

        let mut state = slot.lock().await;
        assert!(state.release().is_some());
        assert!(state.release().is_none());
    }

    #[tokio::test]
    async fn stats_count_connecting_slots() {
        let registry = SessionRegistry::new();
        let (_a, mut a) = registry.acquire("s1").await;
        a.begin_connect();
        drop(a);
        let (_b, b) = registry.acquire("s2").await;
        drop(b);

        let stats = registry.stats().await;
        assert_eq!(stats.sessions, 2);
        assert_eq!(stats.connecting, 1);
        assert_eq!(registry.attempts("missing").await, 0);
    }
}
