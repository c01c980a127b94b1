//! Randomized exponential backoff for reconnection.

use rand::Rng;
use std::time::Duration;

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Backoff before the first retry.
    pub initial: Duration,
    /// Upper bound on the backoff.
    pub max: Duration,
    /// Growth factor applied after every retry.
    pub factor: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(1000),
            factor: 3,
        }
    }
}

/// Backoff state for one reconnecting client.
///
/// Each delay is drawn uniformly from `[backoff, 5 * backoff)`, after which
/// the backoff grows by `factor` up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            current: config.initial,
            attempts: 0,
        }
    }

    pub fn config(&self) -> BackoffConfig {
        self.config
    }

    /// Backoff the next delay will be drawn from.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Retries scheduled since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Returns the delay before the next retry and advances the backoff.
    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with(&mut rand::thread_rng())
    }

    pub fn next_delay_with<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let base = self.current;
        let delay = if base.is_zero() {
            base
        } else {
            rng.gen_range(base..base * 5)
        };

        self.current = base
            .checked_mul(self.config.factor)
            .unwrap_or(self.config.max)
            .min(self.config.max);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    /// Returns to the initial backoff.
    pub fn reset(&mut self) {
        self.current = self.config.initial;
        self.attempts = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
