//! Retry budget and backoff curves.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Largest attempt budget a policy may carry; it must fit a signed 32-bit column.
pub const MAX_ATTEMPTS_LIMIT: u32 = i32::MAX as u32;

/// Retry policy configuration, owned by a task type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Number of failed executions after which the item is poisoned (>= 1).
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// A policy where the first failure is terminal.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.max_attempts == 0 {
            return Err(DomainError::validation("max_attempts must be at least 1"));
        }
        if self.max_attempts > MAX_ATTEMPTS_LIMIT {
            return Err(DomainError::validation(format!(
                "max_attempts must not exceed {MAX_ATTEMPTS_LIMIT}"
            )));
        }
        if self.base_delay > self.max_delay {
            return Err(DomainError::validation(
                "base_delay must not exceed max_delay",
            ));
        }
        Ok(())
    }

    /// Delay before the next execution after `attempts` failures (1-indexed).
    ///
    /// Non-decreasing in `attempts` and never above `max_delay`.
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }

        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let factor = 1u64.checked_shl(attempts - 1).unwrap_or(u64::MAX);
                base_ms.saturating_mul(factor)
            }
            BackoffStrategy::Linear => base_ms.saturating_mul(u64::from(attempts)),
        };

        Duration::from_millis(delay_ms.min(max_ms))
    }

    /// Whether an item with `attempts` recorded failures may run again.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}
