use std::time::Duration;

use chrono::{DateTime, Utc};
use herald_core::config::RetryConfig;

/// Exponential backoff with a cap and an attempt ceiling.
///
/// Schedule with the defaults: 30 s → 60 s → 120 s → … → 30 min (cap), give
/// up once a job has been claimed `max_attempts` times without success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: u32,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before the retry following failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.multiplier
            .checked_pow(attempt.saturating_sub(1))
            .and_then(|factor| self.initial_backoff.checked_mul(factor))
            .map(|delay| delay.min(self.max_backoff))
            .unwrap_or(self.max_backoff)
    }

    pub fn next_attempt_at(&self, now: DateTime<Utc>, attempt: u32) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.backoff(attempt))
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        now + delay
    }

    /// True once `attempt_count` claims have used up the budget.
    pub fn exhausted(&self, attempt_count: u32) -> bool {
        attempt_count >= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            initial_backoff: Duration::from_secs(cfg.initial_backoff_secs),
            multiplier: cfg.multiplier.max(1),
            max_backoff: Duration::from_secs(cfg.max_backoff_secs),
        }
    }
}
