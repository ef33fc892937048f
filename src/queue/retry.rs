//! Retry delay policies.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Base delay for exponential and jittered backoff.
pub const EXPONENTIAL_BASE: Duration = Duration::from_millis(1000);

/// Base delay for linear backoff.
pub const LINEAR_BASE: Duration = Duration::from_millis(2000);

/// Largest share of the computed delay added as jitter.
const JITTER_RATIO: f64 = 0.3;

// 2^16 seconds is already longer than any sane retry delay.
const MAX_EXPONENT: u32 = 16;

/// How the delay before the next attempt grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// `2^n * base`
    #[default]
    Exponential,
    /// `n * base`
    Linear,
    /// Constant delay
    Fixed,
    /// Exponential plus up to 30% random offset
    Jittered,
}

impl std::str::FromStr for RetryStrategy {
    type Err = crate::error::QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "exponential" => Ok(Self::Exponential),
            "linear" => Ok(Self::Linear),
            "fixed" => Ok(Self::Fixed),
            "jittered" => Ok(Self::Jittered),
            other => Err(crate::error::QueueError::Parse(format!(
                "Unknown retry strategy: {other}"
            ))),
        }
    }
}

/// Retry budget and delay computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay growth strategy
    pub strategy: RetryStrategy,
    /// Attempts allowed to fail before dead-lettering
    pub max_retries: u32,
    /// Delay used by [`RetryStrategy::Fixed`]
    pub fixed_delay: Duration,
}

impl RetryPolicy {
    /// Whether an operation that has already been retried `retry_count`
    /// times may be retried again.
    #[must_use]
    pub const fn has_budget(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Delay before the next attempt, given the retry count before increment.
    #[must_use]
    pub fn delay(&self, retry_count: u32) -> Duration {
        match self.strategy {
            RetryStrategy::Exponential => exponential(retry_count),
            RetryStrategy::Linear => LINEAR_BASE.saturating_mul(retry_count),
            RetryStrategy::Fixed => self.fixed_delay,
            RetryStrategy::Jittered => {
                let base = exponential(retry_count);
                let offset = rand::thread_rng().gen_range(0.0..=JITTER_RATIO);
                base + base.mul_f64(offset)
            },
        }
    }
}

fn exponential(retry_count: u32) -> Duration {
    EXPONENTIAL_BASE.saturating_mul(2_u32.saturating_pow(retry_count.min(MAX_EXPONENT)))
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            max_retries: 3,
            fixed_delay: Duration::from_secs(5),
        }
    }
}
