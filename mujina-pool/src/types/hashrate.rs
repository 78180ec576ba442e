//! Hashrate in hashes per second.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::Difficulty;

/// Expected hashes per unit of share difficulty.
const HASHES_PER_DIFFICULTY: f64 = 4_294_967_296.0; // 2^32

/// Hashrate in H/s.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HashRate(f64);

impl HashRate {
    pub const ZERO: Self = Self(0.0);

    pub fn from_hashes_per_sec(value: f64) -> Self {
        if value.is_finite() && value > 0.0 {
            Self(value)
        } else {
            Self::ZERO
        }
    }

    /// Hashrate implied by finding `work` worth of shares over `span`.
    ///
    /// `work × 2^32 / span`. A zero span yields zero rather than infinity.
    pub fn from_work(work: Difficulty, span: Duration) -> Self {
        let secs = span.as_secs_f64();
        if secs <= 0.0 {
            return Self::ZERO;
        }
        Self::from_hashes_per_sec(work.as_f64() * HASHES_PER_DIFFICULTY / secs)
    }

    pub fn as_f64(self) -> f64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0.0
    }
}

impl std::ops::Add for HashRate {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl std::iter::Sum for HashRate {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, |acc, r| acc + r)
    }
}

impl fmt::Display for HashRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = self.0;
        let (scaled, unit) = if value >= 1e15 {
            (value / 1e15, "PH/s")
        } else if value >= 1e12 {
            (value / 1e12, "TH/s")
        } else if value >= 1e9 {
            (value / 1e9, "GH/s")
        } else if value >= 1e6 {
            (value / 1e6, "MH/s")
        } else if value >= 1e3 {
            (value / 1e3, "KH/s")
        } else {
            (value, "H/s")
        };
        write!(f, "{:.2} {}", scaled, unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn from_work_uses_two_to_the_32() {
        let rate = HashRate::from_work(Difficulty::new(5.0), Duration::from_secs(100));
        assert_eq!(rate.as_f64(), 5.0 * 4_294_967_296.0 / 100.0);
    }

    #[test]
    fn zero_span_is_zero_rate() {
        let rate = HashRate::from_work(Difficulty::new(5.0), Duration::ZERO);
        assert!(rate.is_zero());
    }

    #[test_case(0.0, "0.00 H/s")]
    #[test_case(1_500.0, "1.50 KH/s")]
    #[test_case(214_748_364.8, "214.75 MH/s")]
    #[test_case(2.5e12, "2.50 TH/s")]
    fn display(value: f64, expected: &str) {
        assert_eq!(HashRate::from_hashes_per_sec(value).to_string(), expected);
    }
}
