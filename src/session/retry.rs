//! Reconnect scheduling
//!
//! Each session keeps a consecutive-disconnect counter for the current
//! episode and at most one pending reconnect timer. Reaching the attempt
//! limit ends the episode: the counter resets and no timer is armed.

use super::registry::{PendingRetry, SlotState};
use crate::config::schema::RetryConfig;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::debug;

/// Future run when a reconnect timer fires
pub(crate) type RetryFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Capped exponential backoff
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Delay before reconnect number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let base = self.base_delay.as_millis() as f64;
        let cap = self.max_delay.as_millis() as f64;
        let millis = (base * factor).min(cap).max(0.0);
        Duration::from_millis(millis as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms.max(config.base_delay_ms)),
            multiplier: config.multiplier,
        }
    }
}

/// Result of asking for a reconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmOutcome {
    /// A timer is pending for this attempt
    Scheduled { attempt: u32, delay: Duration },
    /// A timer was already pending; nothing changed
    AlreadyPending,
    /// The attempt limit was reached; the counter was reset
    Exhausted { attempts: u32 },
    /// The session is gone or connected; nothing changed
    Suppressed,
}

/// Arms and cancels reconnect timers on registry slots
#[derive(Debug, Clone, Default)]
pub(crate) struct RetryScheduler {
    policy: RetryPolicy,
}

impl RetryScheduler {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Count one disconnect and, unless the limit is hit, start a timer
    /// that runs `on_fire(ticket)` after the backoff delay.
    ///
    /// The caller holds the slot lock; the fired future must check that the
    /// pending ticket still matches before acting.
    pub fn arm<F>(&self, session_id: &str, state: &mut SlotState, on_fire: F) -> ArmOutcome
    where
        F: FnOnce(u64) -> RetryFuture + Send + 'static,
    {
        if state.retired {
            return ArmOutcome::Suppressed;
        }
        if state.retry.is_some() {
            debug!(session_id, "Reconnect already pending");
            return ArmOutcome::AlreadyPending;
        }

        state.attempts = state.attempts.saturating_add(1);
        if state.attempts >= self.policy.max_attempts {
            let attempts = state.attempts;
            state.attempts = 0;
            return ArmOutcome::Exhausted { attempts };
        }

        let attempt = state.attempts;
        let delay = self.policy.delay_for(attempt);
        state.retry_seq += 1;
        let ticket = state.retry_seq;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_fire(ticket).await;
        });
        state.retry = Some(PendingRetry {
            ticket,
            attempt,
            handle,
        });

        ArmOutcome::Scheduled { attempt, delay }
    }

    /// Abort the pending timer, if any
    pub fn cancel(&self, state: &mut SlotState) -> bool {
        match state.retry.take() {
            Some(pending) => {
                pending.handle.abort();
                true
            }
            None => false,
        }
    }

    /// End the episode: cancel the timer and clear the counter
    pub fn reset(&self, state: &mut SlotState) {
        self.cancel(state);
        state.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::registry::SessionRegistry;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }

    fn noop(_ticket: u64) -> RetryFuture {
        Box::pin(async {})
    }

    #[test]
    fn delay_grows_then_caps() {
        let p = policy(100);
        assert_eq!(p.delay_for(1), Duration::from_secs(3));
        assert_eq!(p.delay_for(2), Duration::from_secs(6));
        assert_eq!(p.delay_for(3), Duration::from_secs(12));
        assert_eq!(p.delay_for(5), Duration::from_secs(48));
        assert_eq!(p.delay_for(6), Duration::from_secs(60));
        assert_eq!(p.delay_for(99), Duration::from_secs(60));
        assert_eq!(p.delay_for(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn delay_is_non_decreasing() {
        let p = policy(100);
        let mut last = Duration::ZERO;
        for attempt in 1..=100 {
            let d = p.delay_for(attempt);
            assert!(d >= last, "attempt {attempt}");
            last = d;
        }
    }

    #[test]
    fn multiplier_below_one_is_constant() {
        let p = RetryPolicy {
            multiplier: 0.5,
            ..policy(10)
        };
        assert_eq!(p.delay_for(4), p.base_delay);
    }

    #[test]
    fn policy_from_config() {
        let config = RetryConfig {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 100,
            multiplier: 3.0,
        };
        let p = RetryPolicy::from(&config);
        assert_eq!(p.max_attempts, 5);
        // Cap never sits below the base delay
        assert_eq!(p.max_delay, Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn arm_schedules_one_timer() {
        let registry = SessionRegistry::new();
        let (slot, state) = registry.acquire("s1").await;
        drop(state);
        let scheduler = RetryScheduler::new(policy(100));
        let mut state = slot.lock().await;

        let outcome = scheduler.arm("s1", &mut state, noop);
        assert_eq!(
            outcome,
            ArmOutcome::Scheduled {
                attempt: 1,
                delay: Duration::from_secs(3)
            }
        );
        assert_eq!(
            scheduler.arm("s1", &mut state, noop),
            ArmOutcome::AlreadyPending
        );
        assert_eq!(state.attempts, 1);

        assert!(scheduler.cancel(&mut state));
        assert!(!scheduler.cancel(&mut state));
    }

    #[tokio::test(start_paused = true)]
    async fn timer_fires_with_ticket() {
        let registry = SessionRegistry::new();
        let (slot, state) = registry.acquire("s1").await;
        drop(state);
        let scheduler = RetryScheduler::new(policy(100));
        let fired = Arc::new(AtomicU64::new(0));

        let ticket = {
            let mut state = slot.lock().await;
            let seen = Arc::clone(&fired);
            scheduler.arm("s1", &mut state, move |ticket| {
                Box::pin(async move { seen.store(ticket, Ordering::SeqCst) })
            });
            state.retry.as_ref().map(|r| r.ticket).unwrap()
        };

        tokio::time::sleep(Duration::from_millis(2_900)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), ticket);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let registry = SessionRegistry::new();
        let (slot, state) = registry.acquire("s1").await;
        drop(state);
        let scheduler = RetryScheduler::new(policy(100));
        let fired = Arc::new(AtomicU64::new(0));

        {
            let mut state = slot.lock().await;
            let seen = Arc::clone(&fired);
            scheduler.arm("s1", &mut state, move |ticket| {
                Box::pin(async move { seen.store(ticket, Ordering::SeqCst) })
            });
            scheduler.reset(&mut state);
            assert_eq!(state.attempts, 0);
        }

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn limit_exhausts_and_resets() {
        let registry = SessionRegistry::new();
        let (slot, state) = registry.acquire("s1").await;
        drop(state);
        let scheduler = RetryScheduler::new(policy(3));
        let mut state = slot.lock().await;

        for expected in 1..3 {
            let outcome = scheduler.arm("s1", &mut state, noop);
            assert!(matches!(outcome, ArmOutcome::Scheduled { attempt, .. } if attempt == expected));
            scheduler.cancel(&mut state);
        }

        assert_eq!(
            scheduler.arm("s1", &mut state, noop),
            ArmOutcome::Exhausted { attempts: 3 }
        );
        assert_eq!(state.attempts, 0);
        assert!(state.retry.is_none());
    }

    #[tokio::test]
    async fn retired_slot_is_never_armed() {
        let registry = SessionRegistry::new();
        let (slot, state) = registry.acquire("s1").await;
        drop(state);
        let scheduler = RetryScheduler::default();
        let mut state = slot.lock().await;
        state.retired = true;

        assert_eq!(
            scheduler.arm("s1", &mut state, noop),
            ArmOutcome::Suppressed
        );
        assert_eq!(state.attempts, 0);
    }
}
