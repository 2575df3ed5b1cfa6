use std::time::Duration;

use rand::RngExt;
use serde::{Deserialize, Serialize};

use super::task::FailureKind;

/// Default number of retries after the first attempt.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay before the first retry.
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default cap on any single retry delay.
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Bounded exponential backoff with optional full jitter.
///
/// Delays follow `min(base_delay * 2^attempt, max_delay)`. With jitter
/// enabled the delay is drawn uniformly from `[0, computed]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retries; 0 disables retry.
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(rename = "base_delay_ms", with = "super::task::duration_millis")]
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    #[serde(rename = "max_delay_ms", with = "super::task::duration_millis")]
    pub max_delay: Duration,
    /// Whether to randomize delays.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter: true,
        }
    }

    /// A policy that never retries.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay to wait after the failed attempt `attempt` (zero-based).
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let capped = self.backoff(attempt);
        if !self.jitter || capped.is_zero() {
            return capped;
        }

        let ceiling_ms = capped.as_millis().min(u64::MAX as u128) as u64;
        let drawn = rand::rng().random_range(0..=ceiling_ms);
        Duration::from_millis(drawn)
    }

    /// Delay before jitter is applied.
    pub fn backoff(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Returns whether a failure of `kind` on attempt `attempt` warrants a
    /// new attempt.
    ///
    /// Once `attempt` reaches `max_attempts` the answer is always `false`.
    pub fn should_retry(&self, attempt: u32, kind: FailureKind) -> bool {
        attempt < self.max_attempts && kind.is_transient()
    }

    /// Upper bound on submissions for a single logical task.
    pub fn max_submissions(&self) -> u32 {
        self.max_attempts.saturating_add(1)
    }
}
