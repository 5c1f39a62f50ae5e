//! Exponential backoff as a pure state machine.
//!
//! Nothing here sleeps or reads the clock on its own: callers hand in the
//! current [`RetryState`] (and an `Instant` when they want a schedule) and get
//! back the next delay plus the successor state. This keeps every retry loop in
//! the daemon (process restarts, per-namespace reconciliation, event stream
//! resubscription) deterministic under test.

use std::num::NonZeroU32;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Retry policy. `max_attempts: None` retries forever.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_attempts: Option<NonZeroU32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier,
            max_attempts: None,
        }
    }

    /// Bound the number of retries. Zero means unbounded.
    pub fn max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = NonZeroU32::new(max);
        self
    }

    /// Delay for a zero-based attempt index, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exp);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Per-owner retry bookkeeping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryState {
    pub attempts: u32,
    pub current_delay: Duration,
    pub next_eligible_at: Option<Instant>,
    pub exhausted: bool,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a retry may be issued at `now`.
    pub fn is_eligible(&self, now: Instant) -> bool {
        !self.exhausted && self.next_eligible_at.is_none_or(|at| at <= now)
    }
}

/// Outcome of asking for the next delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStep {
    Retry(Duration),
    Exhausted,
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffEngine {
    policy: RetryPolicy,
}

impl BackoffEngine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Compute the delay before the next attempt and the state after it.
    ///
    /// Once the attempt bound is reached the engine reports
    /// [`BackoffStep::Exhausted`] on every call until [`BackoffEngine::reset`].
    pub fn next_delay(&self, state: &RetryState) -> (BackoffStep, RetryState) {
        if state.exhausted {
            return (BackoffStep::Exhausted, state.clone());
        }

        if let Some(max) = self.policy.max_attempts {
            if state.attempts >= max.get() {
                let next = RetryState {
                    exhausted: true,
                    next_eligible_at: None,
                    ..state.clone()
                };
                return (BackoffStep::Exhausted, next);
            }
        }

        let delay = self.policy.delay_for_attempt(state.attempts);
        let next = RetryState {
            attempts: state.attempts.saturating_add(1),
            current_delay: delay,
            next_eligible_at: state.next_eligible_at,
            exhausted: false,
        };
        (BackoffStep::Retry(delay), next)
    }

    /// Like [`BackoffEngine::next_delay`], also recording when the retry
    /// becomes eligible.
    pub fn schedule(&self, state: &RetryState, now: Instant) -> (BackoffStep, RetryState) {
        let (step, mut next) = self.next_delay(state);
        if let BackoffStep::Retry(delay) = step {
            next.next_eligible_at = Some(now + delay);
        }
        (step, next)
    }

    /// Fresh state after a confirmed success.
    pub fn reset(&self, _state: &RetryState) -> RetryState {
        RetryState::default()
    }
}
