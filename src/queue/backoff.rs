//! Exponential backoff between job attempts.
//!
//! The delay after the `n`th failed attempt (1-indexed) is
//! `initial_delay * multiplier^(n-1)`, capped at `max_delay`:
//!
//! - Default: 1s, 2s, 4s, 8s, ... up to 60s

use std::time::Duration;

/// Configuration for exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,

    /// Maximum delay between attempts (cap for exponential growth).
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (typically 2.0).
    pub multiplier: f64,
}

impl BackoffConfig {
    pub const DEFAULT: Self = Self {
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(60),
        multiplier: 2.0,
    };

    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier: 2.0,
        }
    }

    /// Computes the delay after the given failed attempt (1-indexed).
    ///
    /// Attempt 0 is treated like attempt 1.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let multiplier = self.multiplier.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let capped_secs = delay_secs.min(self.max_delay.as_secs_f64());
        if capped_secs.is_finite() {
            Duration::from_secs_f64(capped_secs)
        } else {
            self.max_delay
        }
    }

    /// Delays for attempts `1..=attempts`.
    pub fn delays(&self, attempts: u32) -> impl Iterator<Item = Duration> + '_ {
        (1..=attempts).map(|attempt| self.delay_for_attempt(attempt))
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
