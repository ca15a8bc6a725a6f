//! Retry and poll policies.
//!
//! Delays are pure functions of the attempt number and the counters stored on
//! the job.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Bounded retries with exponential backoff.
///
/// `delay_for_attempt(n)` is `base * 2^(n-1)`, capped at `max_delay`, then
/// spread by up to `jitter` of itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, the first one included. `0` and `1` both mean "never retry".
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction in `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_secs(1), Duration::from_secs(30))
    }
}

impl RetryPolicy {
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay: max_delay.max(base_delay),
            jitter: 0.1,
        }
    }

    /// Same delay before every retry.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::exponential(max_attempts, delay, delay).with_jitter(0.0)
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay to wait after the `attempt`-th failure (1-indexed; `0` waits nothing).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let doublings = attempt.saturating_sub(1).min(31);
        let capped = self
            .base_delay
            .checked_mul(1u32 << doublings)
            .map_or(self.max_delay, |d| d.min(self.max_delay));

        if self.jitter == 0.0 {
            return capped;
        }
        // Deterministic spread in [-jitter, +jitter], varying with the attempt.
        let phase = f64::from((attempt.wrapping_mul(37)) % 101) / 100.0;
        let factor = 1.0 + self.jitter * (2.0 * phase - 1.0);
        // Spreading a delay near `Duration::MAX` saturates instead of overflowing.
        Duration::try_from_secs_f64(capped.as_secs_f64() * factor.max(0.0)).unwrap_or(Duration::MAX)
    }

    /// Longest a full run can take when each attempt is bounded by `per_attempt`.
    pub fn worst_case(&self, per_attempt: Duration) -> Duration {
        let attempts = self.max_attempts.max(1);
        (1..attempts).fold(per_attempt.saturating_mul(attempts), |total, n| {
            total.saturating_add(self.delay_for_attempt(n))
        })
    }

    /// Whether another attempt may follow `attempts_made` failed ones.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

/// How the render poller paces and bounds a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollPolicy {
    /// Delay before the next poll, indexed by the job's poll count.
    pub backoff: RetryPolicy,
    /// Transient poll failures tolerated before the job is failed.
    pub max_transient_retries: u32,
    /// Wall-clock bound from submission, unless the job overrides it.
    pub render_timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            backoff: RetryPolicy::exponential(0, Duration::from_secs(5), Duration::from_secs(60)).with_jitter(0.0),
            max_transient_retries: 5,
            render_timeout: Duration::from_secs(3600),
        }
    }
}

impl PollPolicy {
    pub fn next_poll_delay(&self, poll_count: u32) -> Duration {
        self.backoff.delay_for_attempt(poll_count)
    }
}
