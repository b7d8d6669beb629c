use std::time::Duration;

use serde::Deserialize;

/// Exponential backoff between retry attempts.
///
/// Attempt `n` (1-based) waits `delay * exponent^(n - 1)`, never longer than
/// `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Backoff {
    /// The delay before the first retry.
    #[serde(with = "millis")]
    pub delay: Duration,

    /// The factor to increase the delay by after each attempt.
    pub exponent: u32,

    /// The maximum delay for any single wait.
    #[serde(with = "millis")]
    pub max_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(500),
            exponent: 2,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl Backoff {
    /// Create a new backoff policy.
    pub fn new(delay: Duration, exponent: u32, max_delay: Duration) -> Self {
        Self {
            delay,
            exponent,
            max_delay,
        }
    }

    /// A backoff which never waits.
    pub fn none() -> Self {
        Self::new(Duration::ZERO, 1, Duration::ZERO)
    }

    /// The delay to wait after the given (1-based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self
            .exponent
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Sleep for the delay which follows the given (1-based) failed attempt.
    pub async fn wait(&self, attempt: u32) {
        let delay = self.delay_for(attempt);
        if !delay.is_zero() {
            tracing::trace!(?delay, %attempt, "backing off");
            tokio::time::sleep(delay).await;
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize as _, Deserializer};

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
