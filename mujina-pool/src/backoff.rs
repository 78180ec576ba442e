//! Jittered exponential backoff for retrying background work.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::time::Duration;

/// Exponential backoff with a consecutive-failure count.
///
/// Each [`failure`](Self::failure) doubles the nominal delay up to `max` and
/// returns it scaled by a jitter factor in [0.5, 1.0). A
/// [`success`](Self::success) restores the initial delay.
#[derive(Debug)]
pub struct ExponentialBackoff {
    current: Duration,
    initial: Duration,
    max: Duration,
    failures: u32,
    // Seeded from OS randomness, so separate processes jitter differently.
    jitter_state: RandomState,
    jitter_step: u64,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial,
            initial,
            max,
            failures: 0,
            jitter_state: RandomState::new(),
            jitter_step: 0,
        }
    }

    /// Record a failure and return how long to wait before the next try.
    pub fn failure(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);

        let nominal = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);

        let mut hasher = self.jitter_state.build_hasher();
        hasher.write_u64(self.jitter_step);
        self.jitter_step = self.jitter_step.wrapping_add(1);
        let jitter = 0.5 + (hasher.finish() as f64 / u64::MAX as f64) * 0.5;

        nominal.mul_f64(jitter)
    }

    pub fn success(&mut self) {
        self.current = self.initial;
        self.failures = 0;
    }

    /// Failures since the last success.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// True while retries are being delayed.
    pub fn is_backing_off(&self) -> bool {
        self.failures > 0
    }
}
