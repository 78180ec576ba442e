//! Share difficulty as assigned to workers.

use std::fmt;

use bitcoin::pow::Target;
use ruint::aliases::U256;
use serde::{Deserialize, Serialize};

/// Share difficulty.
///
/// Pools hand out fractional difficulties (the default for new workers is
/// 0.0001), so unlike network difficulty this is kept as `f64`. Reward
/// weighting and hashrate estimation both sum these values directly.
///
/// The inverse relationship with the share target still holds:
/// ```text
/// target = MAX_TARGET / difficulty
/// ```
/// [`Difficulty::share_target`] produces the target handed to miners with
/// each work response so they know which solutions are worth submitting.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Difficulty(f64);

impl Difficulty {
    /// Create a difficulty. Non-finite or negative values clamp to zero.
    pub fn new(value: f64) -> Self {
        if value.is_finite() && value > 0.0 {
            Self(value)
        } else {
            Self(0.0)
        }
    }

    pub fn as_f64(self) -> f64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0.0
    }

    /// Target a share must meet at this difficulty.
    ///
    /// Difficulties of one and above divide `MAX_TARGET` by the truncated
    /// integer difficulty; sub-1.0 difficulties multiply it by the inverse,
    /// saturating at the top of the 256-bit range. Zero maps to the easiest
    /// possible target.
    pub fn share_target(self) -> Target {
        let max_target = U256::from_le_bytes(Target::MAX.to_le_bytes());

        let target = if self.0 <= 0.0 {
            U256::MAX
        } else if self.0 >= 1.0 {
            max_target / U256::from((self.0 as u64).max(1))
        } else {
            let multiplier = (1.0 / self.0) as u64;
            max_target.saturating_mul(U256::from(multiplier))
        };

        Target::from_le_bytes(target.to_le_bytes())
    }

    /// Share target as big-endian hex, the form miners expect on the wire.
    pub fn share_target_hex(self) -> String {
        hex::encode(self.share_target().to_be_bytes())
    }
}

impl From<f64> for Difficulty {
    fn from(value: f64) -> Self {
        Self::new(value)
    }
}

impl std::ops::Add for Difficulty {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl std::ops::AddAssign for Difficulty {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl std::iter::Sum for Difficulty {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), |acc, d| acc + d)
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = self.0;

        if value < 1.0 {
            let s = format!("{:.6}", value);
            let trimmed = s.trim_end_matches('0').trim_end_matches('.');
            return write!(f, "{}", if trimmed.is_empty() { "0" } else { trimmed });
        }

        let (scaled, suffix) = if value >= 1e12 {
            (value / 1e12, "T")
        } else if value >= 1e9 {
            (value / 1e9, "G")
        } else if value >= 1e6 {
            (value / 1e6, "M")
        } else if value >= 1e3 {
            (value / 1e3, "K")
        } else {
            (value, "")
        };

        if scaled >= 100.0 || scaled.fract() == 0.0 {
            write!(f, "{:.0}{}", scaled, suffix)
        } else if scaled >= 10.0 {
            write!(f, "{:.1}{}", scaled, suffix)
        } else {
            write!(f, "{:.2}{}", scaled, suffix)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn invalid_values_clamp_to_zero() {
        assert!(Difficulty::new(-1.0).is_zero());
        assert!(Difficulty::new(f64::NAN).is_zero());
        assert!(Difficulty::new(f64::INFINITY).is_zero());
        assert_eq!(Difficulty::new(0.0001).as_f64(), 0.0001);
    }

    #[test]
    fn difficulty_one_is_max_target() {
        assert_eq!(Difficulty::new(1.0).share_target(), Target::MAX);
    }

    #[test]
    fn higher_difficulty_gives_smaller_target() {
        let easy = Difficulty::new(100.0).share_target();
        let hard = Difficulty::new(1000.0).share_target();
        assert!(hard < easy);
    }

    #[test]
    fn sub_one_difficulty_exceeds_max_target() {
        let target = Difficulty::new(0.5).share_target();
        assert!(target > Target::MAX);

        let expected = U256::from_le_bytes(Target::MAX.to_le_bytes()) * U256::from(2u64);
        assert_eq!(U256::from_le_bytes(target.to_le_bytes()), expected);
    }

    #[test]
    fn share_target_hex_is_big_endian() {
        let hex = Difficulty::new(1.0).share_target_hex();
        assert_eq!(hex.len(), 64);
        assert!(hex.starts_with("00000000ffff"), "got {hex}");
    }

    #[test]
    fn sums_difficulties() {
        let total: Difficulty = [1.0, 2.0, 3.5].into_iter().map(Difficulty::new).sum();
        assert_eq!(total.as_f64(), 6.5);
    }

    #[test_case(0.0001, "0.0001")]
    #[test_case(0.5, "0.5")]
    #[test_case(1.0, "1")]
    #[test_case(500.0, "500")]
    #[test_case(1_500_000.0, "1.50M")]
    #[test_case(11_200_000_000_000.0, "11.2T")]
    fn display(value: f64, expected: &str) {
        assert_eq!(Difficulty::new(value).to_string(), expected);
    }
}
