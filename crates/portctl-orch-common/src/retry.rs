//! Retry policy with bounded attempts and exponential backoff.
//!
//! Attempt numbers are 1-based: attempt 1 is the first try. After a failed
//! attempt `n` the caller retries only if [`RetryPolicy::should_retry`]
//! returns true, sleeping [`RetryPolicy::backoff`]`(n)` first.
//!
//! The nominal delay after attempt `n` is `base * multiplier^(n-1)`. Jitter
//! adds up to `jitter * nominal` on top. As long as `multiplier > 1` and
//! `multiplier >= 1 + jitter` (enforced by [`RetryPolicy::validate`]) the
//! jittered delays are strictly increasing until `max_delay` caps them.

use rand::Rng;
use std::time::Duration;
use thiserror::Error;

/// Invalid retry policy parameters.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RetryPolicyError {
    #[error("max_attempts must be at least 1")]
    NoAttempts,

    #[error("multiplier ({multiplier}) must be > 1 and >= 1 + jitter ({jitter})")]
    NotIncreasing { multiplier: f64, jitter: f64 },

    #[error("jitter ({0}) must be within [0, 1)")]
    JitterOutOfRange(f64),
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
    jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the default multiplier, cap and jitter.
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Self::default()
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Checks that the policy terminates and that its delays increase.
    pub fn validate(&self) -> Result<(), RetryPolicyError> {
        if self.max_attempts == 0 {
            return Err(RetryPolicyError::NoAttempts);
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(RetryPolicyError::JitterOutOfRange(self.jitter));
        }
        if self.multiplier <= 1.0 || self.multiplier < 1.0 + self.jitter {
            return Err(RetryPolicyError::NotIncreasing {
                multiplier: self.multiplier,
                jitter: self.jitter,
            });
        }
        Ok(())
    }

    /// Returns true if another attempt is allowed after `attempts_made`.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Nominal (jitter-free) delay after the given failed attempt.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let millis = self.base_delay.as_secs_f64() * 1000.0 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_secs_f64() * 1000.0);
        Duration::from_micros((capped * 1000.0) as u64)
    }

    /// Jittered delay after the given failed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_with(attempt, &mut rand::thread_rng())
    }

    /// Jittered delay using the supplied random source.
    pub fn backoff_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if self.jitter <= 0.0 {
            return nominal;
        }
        let jitter = nominal.mul_f64(rng.gen_range(0.0..self.jitter));
        (nominal + jitter).min(self.max_delay)
    }
}
