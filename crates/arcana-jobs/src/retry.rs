//! Retry policies for failed jobs.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry strategy enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Exponential backoff.
    Exponential,
    /// Linear backoff.
    Linear,
    /// Fixed delay between retries.
    Fixed,
}

/// Retry policy configuration.
///
/// Durations are encoded as integer nanoseconds on the wire, matching the
/// job record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the initial attempt.
    pub max_retries: u32,

    /// Retry strategy.
    pub strategy: RetryStrategy,

    /// Initial delay.
    #[serde(with = "crate::job::duration_nanos")]
    pub initial_delay: Duration,

    /// Maximum delay.
    #[serde(with = "crate::job::duration_nanos")]
    pub max_delay: Duration,

    /// Backoff multiplier (exponential strategy).
    pub multiplier: f64,

    /// Whether consumers may add jitter to the computed delay.
    pub jitter_enabled: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3)
    }
}

impl RetryPolicy {
    /// Creates an exponential backoff retry policy.
    pub fn exponential(max_retries: u32) -> Self {
        Self {
            max_retries,
            strategy: RetryStrategy::Exponential,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3600),
            multiplier: 2.0,
            jitter_enabled: false,
        }
    }

    /// Creates a linear backoff retry policy.
    pub fn linear(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            max_retries,
            strategy: RetryStrategy::Linear,
            initial_delay,
            max_delay: Duration::from_secs(3600),
            multiplier: 1.0,
            jitter_enabled: false,
        }
    }

    /// Creates a fixed delay retry policy.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            strategy: RetryStrategy::Fixed,
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter_enabled: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Enables jitter.
    pub fn with_jitter(mut self) -> Self {
        self.jitter_enabled = true;
        self
    }

    /// Calculates the retry delay for the given attempt number (1-based).
    ///
    /// Deterministic: the stored `scheduled_at` is always the raw delay.
    /// Jitter, when enabled, is applied separately via [`delay_with_jitter`].
    ///
    /// [`delay_with_jitter`]: RetryPolicy::delay_with_jitter
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base = match self.strategy {
            RetryStrategy::Exponential => {
                let exp = (attempt - 1) as i32;
                let delay = self.initial_delay.as_nanos() as f64 * self.multiplier.powi(exp);
                Duration::from_nanos(delay as u64)
            }
            RetryStrategy::Linear => self.initial_delay.saturating_mul(attempt),
            RetryStrategy::Fixed => self.initial_delay,
        };

        base.min(self.max_delay)
    }

    /// Calculates the retry delay with positive jitter applied.
    ///
    /// Jitter is uniform in `[0, delay/4]` (at most 25% on top of the raw
    /// delay), drawn from a time-seeded LCG. Only the queue's fail path calls
    /// this, and only when `jitter_enabled` is set.
    pub fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let base = self.delay_for_attempt(attempt);
        if !self.jitter_enabled {
            return base;
        }

        let range = base.as_nanos() as u64 / 4;
        base + Duration::from_nanos(rand_jitter(range))
    }
}

/// Generate random jitter using a simple LCG.
fn rand_jitter(range: u64) -> u64 {
    use std::time::SystemTime;

    if range == 0 {
        return 0;
    }

    let seed = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;

    // LCG parameters
    let a: u64 = 6364136223846793005;
    let c: u64 = 1442695040888963407;

    let random = seed.wrapping_mul(a).wrapping_add(c);
    random % (range + 1)
}
