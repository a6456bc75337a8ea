//! Retry/backoff policy: capped exponential delay with full jitter.

use std::time::Duration;

/// Backoff policy for broker (re)connection attempts.
///
/// The delay for attempt `n` (0-indexed, counting failures so far) is
/// `min(max_delay, base_delay * 2^n)` scaled by a uniform random factor
/// in `[0, 1)` — "full jitter". Randomizing the whole delay rather than
/// a fraction of it keeps independently restarting processes from
/// hammering the broker in lockstep.
///
/// `max_attempts` bounds startup-mode acquisition; background
/// reconnection uses an unbounded policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry (pre-jitter).
    pub base_delay: Duration,
    /// Cap applied before jitter.
    pub max_delay: Duration,
    /// Maximum number of failed attempts tolerated; `None` = unbounded.
    pub max_attempts: Option<u32>,
}

const BASE_RETRY_DELAY_MS: u64 = 1_000;
const MAX_RETRY_DELAY_MS: u64 = 30_000;

impl RetryPolicy {
    /// Bounded policy with the default delays (1s base, 30s cap).
    pub fn bounded(max_attempts: u32) -> Self {
        Self {
            base_delay: Duration::from_millis(BASE_RETRY_DELAY_MS),
            max_delay: Duration::from_millis(MAX_RETRY_DELAY_MS),
            max_attempts: Some(max_attempts),
        }
    }

    /// Unbounded policy with the default delays.
    pub fn unbounded() -> Self {
        Self {
            base_delay: Duration::from_millis(BASE_RETRY_DELAY_MS),
            max_delay: Duration::from_millis(MAX_RETRY_DELAY_MS),
            max_attempts: None,
        }
    }

    pub fn with_delays(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    /// Exponential delay for the given number of failures so far,
    /// capped at `max_delay`, before jitter is applied.
    pub fn capped_delay(&self, attempts: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let exp_ms = base_ms * 2_f64.powf(f64::from(attempts));
        Duration::from_millis(exp_ms.min(max_ms) as u64)
    }

    /// Jittered delay for the given number of failures so far.
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let capped_ms = self.capped_delay(attempts).as_millis() as f64;
        let jittered_ms = capped_ms * rand::random::<f64>();
        Duration::from_millis(jittered_ms.round() as u64)
    }

    /// Whether the given number of failures exhausts the policy.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempts >= max,
            None => false,
        }
    }
}
