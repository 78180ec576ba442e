//! Round boundaries.
//!
//! A policy decides which valid shares a solved block pays for. Shares
//! timestamped after the block's discovery time always belong to a later
//! round.

use std::fmt;
use std::time::Duration;

use crate::config::RewardScheme;
use crate::store::{Block, Share, Tables};

pub trait RoundPolicy: fmt::Debug + Send + Sync {
    /// Valid shares attributable to `block`.
    fn attributable<'a>(&self, tables: &'a Tables, block: &Block) -> Vec<&'a Share>;
}

/// Build the policy selected in configuration.
pub fn from_scheme(scheme: RewardScheme, lookback: Duration) -> Box<dyn RoundPolicy> {
    match scheme {
        RewardScheme::Proportional => Box::new(Proportional { lookback }),
        RewardScheme::Pplns { n } => Box::new(TrailingShares { n }),
    }
}

/// Every valid share since the previous block.
///
/// The round is `(previous block's discovery time, this block's discovery
/// time]`, so a share on the boundary counts exactly once. Without a
/// previous block the round starts `lookback` before discovery.
#[derive(Debug, Clone)]
pub struct Proportional {
    pub lookback: Duration,
}

impl RoundPolicy for Proportional {
    fn attributable<'a>(&self, tables: &'a Tables, block: &Block) -> Vec<&'a Share> {
        let end = block.timestamp;
        let start = tables
            .block_before(block.height)
            .map(|prev| prev.timestamp)
            .unwrap_or(end - self.lookback);

        tables
            .shares()
            .iter()
            .filter(|s| s.valid && s.timestamp > start && s.timestamp <= end)
            .collect()
    }
}

/// The last `n` valid shares up to the block's discovery time, regardless
/// of round boundaries (PPLNS).
#[derive(Debug, Clone)]
pub struct TrailingShares {
    pub n: usize,
}

impl RoundPolicy for TrailingShares {
    fn attributable<'a>(&self, tables: &'a Tables, block: &Block) -> Vec<&'a Share> {
        tables
            .shares()
            .iter()
            .rev()
            .filter(|s| s.valid && s.timestamp <= block.timestamp)
            .take(self.n)
            .collect()
    }
}
