//! Reconnection backoff configuration and math.
//!
//! Sync-only building blocks; the async reconnect loop lives in the client
//! crate and feeds randomness in from its own PRNG.
//!
//! - [`BackoffConfig`]: base delay, multiplier, cap, jitter, attempt limit
//! - [`backoff_delay_ms`]: raw exponential delay for one attempt
//! - [`Backoff`]: stateful schedule that never shrinks between attempts

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Default base delay in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 500;
/// Default growth factor between attempts.
pub const DEFAULT_MULTIPLIER: f64 = 2.0;
/// Default maximum delay in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
/// Default jitter factor (0.0–1.0).
pub const DEFAULT_JITTER_FACTOR: f64 = 0.2;
/// Default number of reconnect attempts before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Exponential backoff parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackoffConfig {
    /// Delay before the first retry in ms.
    pub base_delay_ms: u64,
    /// Growth factor applied per attempt (values below 1.0 are treated as 1.0).
    pub multiplier: f64,
    /// Upper bound on any single delay in ms.
    pub max_delay_ms: u64,
    /// Jitter factor 0.0–1.0; the delay is stretched by up to this fraction.
    pub jitter_factor: f64,
    /// Attempts allowed before the schedule is exhausted.
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            multiplier: DEFAULT_MULTIPLIER,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter_factor: DEFAULT_JITTER_FACTOR,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Backoff calculation
// ─────────────────────────────────────────────────────────────────────────────

/// Delay for a zero-based `attempt`, before jitter.
///
/// Formula: `min(max_delay, base_delay * multiplier^attempt)`.
#[must_use]
pub fn backoff_delay_ms(attempt: u32, config: &BackoffConfig) -> u64 {
    let multiplier = config.multiplier.max(1.0);
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let raw = (config.base_delay_ms as f64) * multiplier.powi(exponent);
    let max = config.max_delay_ms as f64;
    if raw.is_finite() && raw < max {
        raw.round() as u64
    } else {
        config.max_delay_ms
    }
}

/// Delay with upward-only jitter. `random` should be in `[0.0, 1.0)`.
#[must_use]
pub fn backoff_delay_with_random(attempt: u32, config: &BackoffConfig, random: f64) -> u64 {
    let base = backoff_delay_ms(attempt, config);
    let jitter = config.jitter_factor.clamp(0.0, 1.0) * random.clamp(0.0, 1.0);
    let stretched = ((base as f64) * (1.0 + jitter)).round() as u64;
    stretched.min(config.max_delay_ms)
}

/// Stateful schedule over a [`BackoffConfig`].
///
/// Each delay is at least the previous one and at most `max_delay_ms`, so
/// the sequence is non-decreasing even with jitter applied.
#[derive(Clone, Debug)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
    last_ms: u64,
}

impl Backoff {
    /// Fresh schedule.
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempt: 0,
            last_ms: 0,
        }
    }

    /// Delay before the next attempt, or `None` once `max_attempts` is spent.
    pub fn next_delay(&mut self, random: f64) -> Option<Duration> {
        if self.attempt >= self.config.max_attempts {
            return None;
        }
        let delay = backoff_delay_with_random(self.attempt, &self.config, random).max(self.last_ms);
        self.attempt += 1;
        self.last_ms = delay;
        Some(Duration::from_millis(delay))
    }

    /// Attempts consumed so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Start over after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last_ms = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn config() -> BackoffConfig {
        BackoffConfig {
            base_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 1_000,
            jitter_factor: 0.0,
            max_attempts: 6,
        }
    }

    #[test]
    fn grows_exponentially_then_caps() {
        let c = config();
        let delays: Vec<u64> = (0..6).map(|a| backoff_delay_ms(a, &c)).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
    }

    #[test]
    fn huge_attempt_does_not_overflow() {
        assert_eq!(backoff_delay_ms(u32::MAX, &config()), 1_000);
    }

    #[test]
    fn multiplier_below_one_is_flat() {
        let c = BackoffConfig {
            multiplier: 0.5,
            ..config()
        };
        assert_eq!(backoff_delay_ms(3, &c), 100);
    }

    #[test]
    fn jitter_stretches_within_cap() {
        let c = BackoffConfig {
            jitter_factor: 0.5,
            ..config()
        };
        assert_eq!(backoff_delay_with_random(0, &c, 0.0), 100);
        assert_eq!(backoff_delay_with_random(0, &c, 0.9), 145);
        assert_eq!(backoff_delay_with_random(4, &c, 0.9), 1_000);
    }

    #[test]
    fn schedule_stops_after_max_attempts() {
        let mut b = Backoff::new(config());
        let mut n = 0;
        while b.next_delay(0.5).is_some() {
            n += 1;
        }
        assert_eq!(n, 6);
        assert_eq!(b.attempt(), 6);
        b.reset();
        assert_eq!(b.next_delay(0.0), Some(Duration::from_millis(100)));
    }

    proptest! {
        #[test]
        fn schedule_is_non_decreasing_and_capped(
            randoms in proptest::collection::vec(0.0f64..1.0, 1..20),
            jitter in 0.0f64..1.0,
        ) {
            let mut b = Backoff::new(BackoffConfig {
                jitter_factor: jitter,
                max_attempts: 20,
                ..config()
            });
            let mut last = Duration::ZERO;
            for r in randoms {
                let d = b.next_delay(r).unwrap();
                prop_assert!(d >= last);
                prop_assert!(d <= Duration::from_millis(1_000));
                last = d;
            }
        }
    }
}
