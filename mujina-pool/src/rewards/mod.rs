//! Reward distribution.
//!
//! When a block is recorded its net reward, `reward × (1 − fee)`, is split
//! across the workers whose valid shares the round policy attributes to it,
//! in proportion to their summed share difficulty. Each worker gets one
//! pending [`Payment`](crate::store::Payment) and an equal increase of its
//! pending balance, in the caller's transaction.

mod policy;

use std::collections::BTreeMap;

use time::OffsetDateTime;

pub use policy::{Proportional, RoundPolicy, TrailingShares, from_scheme};

use crate::error::Result;
use crate::store::{Block, Tx};
use crate::tracing::prelude::*;
use crate::types::Difficulty;

/// Result of distributing one block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Distribution {
    pub net_reward: f64,
    pub total_difficulty: f64,
    /// Amount credited per worker.
    pub credits: BTreeMap<String, f64>,
}

impl Distribution {
    pub fn is_empty(&self) -> bool {
        self.credits.is_empty()
    }
}

#[derive(Debug)]
pub struct RewardDistributor {
    policy: Box<dyn RoundPolicy>,
    pool_fee: f64,
}

impl RewardDistributor {
    pub fn new(policy: Box<dyn RoundPolicy>, pool_fee: f64) -> Self {
        Self { policy, pool_fee }
    }

    /// Credit `block`'s net reward to the round's contributors.
    ///
    /// A round with no attributable work credits nobody and is not an
    /// error.
    pub fn distribute(
        &self,
        tx: &mut Tx<'_>,
        block: &Block,
        now: OffsetDateTime,
    ) -> Result<Distribution> {
        let mut per_worker: BTreeMap<String, Difficulty> = BTreeMap::new();
        for share in self.policy.attributable(&**tx, block) {
            *per_worker.entry(share.worker.clone()).or_default() += share.difficulty;
        }
        let total: Difficulty = per_worker.values().copied().sum();
        let net_reward = block.reward * (1.0 - self.pool_fee);

        if total.is_zero() {
            info!(height = block.height, "No attributable shares; block reward not distributed");
            return Ok(Distribution {
                net_reward,
                ..Default::default()
            });
        }

        let mut credits = BTreeMap::new();
        for (address, difficulty) in per_worker {
            let amount = net_reward * (difficulty.as_f64() / total.as_f64());
            tx.insert_payment(&address, amount, block.height, now);
            tx.update_worker(&address, |w| w.pending_balance += amount)?;
            credits.insert(address, amount);
        }

        debug!(
            height = block.height,
            workers = credits.len(),
            net_reward,
            "Block reward distributed"
        );
        Ok(Distribution {
            net_reward,
            total_difficulty: total.as_f64(),
            credits,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use time::macros::datetime;

    use super::*;
    use crate::store::{PaymentStatus, Store, Worker};

    const FOUND: OffsetDateTime = datetime!(2024-05-01 12:00 UTC);
    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn minutes(n: i64) -> time::Duration {
        time::Duration::minutes(n)
    }

    fn block(height: u64, timestamp: OffsetDateTime) -> Block {
        Block {
            height,
            hash: format!("{height:064x}"),
            prev_hash: String::new(),
            timestamp,
            difficulty: 1.0,
            reward: 50.0,
            finder: "miner-a".into(),
            confirmations: 0,
            tx_count: 1,
        }
    }

    fn store_with(shares: &[(&str, f64, OffsetDateTime, bool)]) -> Store {
        let store = Store::in_memory();
        store
            .transaction(|tx| {
                for (address, difficulty, ts, valid) in shares {
                    if tx.worker(address).is_none() {
                        tx.insert_worker(Worker::new(*address, Difficulty::new(1.0), *ts))?;
                    }
                    tx.insert_share(address, *ts, Difficulty::new(*difficulty), *valid);
                }
                Ok(())
            })
            .unwrap();
        store
    }

    fn proportional() -> RewardDistributor {
        RewardDistributor::new(Box::new(Proportional { lookback: DAY }), 0.01)
    }

    #[test]
    fn splits_by_difficulty_with_fee() {
        let store = store_with(&[
            ("miner-a", 3.0, FOUND - minutes(30), true),
            ("miner-b", 7.0, FOUND - minutes(20), true),
        ]);

        let dist = store
            .transaction(|tx| {
                let b = block(1000, FOUND);
                tx.insert_block(b.clone())?;
                proportional().distribute(tx, &b, FOUND)
            })
            .unwrap();

        assert!((dist.credits["miner-a"] - 14.85).abs() < 1e-9);
        assert!((dist.credits["miner-b"] - 34.65).abs() < 1e-9);

        let payments = store.read(|t| t.payments().to_vec());
        assert_eq!(payments.len(), 2);
        assert!(payments.iter().all(|p| p.status == PaymentStatus::Pending));
        assert!(payments.iter().all(|p| p.block_height == 1000));
        let sum: f64 = payments.iter().map(|p| p.amount).sum();
        assert!((sum - 49.5).abs() < 1e-8);

        assert!((store.worker("miner-a").unwrap().pending_balance - 14.85).abs() < 1e-9);
        assert!((store.worker("miner-b").unwrap().pending_balance - 34.65).abs() < 1e-9);
    }

    #[test]
    fn payments_sum_to_net_reward() {
        let shares: Vec<(String, f64)> = (0..37)
            .map(|i| (format!("miner-{}", i % 11), 0.0001 * (1 + i * 7 % 13) as f64))
            .collect();
        let refs: Vec<(&str, f64, OffsetDateTime, bool)> = shares
            .iter()
            .enumerate()
            .map(|(i, (a, d))| (a.as_str(), *d, FOUND - minutes(i as i64 + 1), true))
            .collect();
        let store = store_with(&refs);

        let dist = store
            .transaction(|tx| proportional().distribute(tx, &block(1000, FOUND), FOUND))
            .unwrap();

        let sum: f64 = dist.credits.values().sum();
        assert!((sum - 50.0 * 0.99).abs() < 1e-8);
    }

    #[test]
    fn round_starts_after_previous_block() {
        let prev_found = FOUND - minutes(60);
        let store = store_with(&[
            ("miner-a", 5.0, prev_found - minutes(5), true),
            // On the boundary: belongs to the previous round.
            ("miner-a", 5.0, prev_found, true),
            ("miner-b", 2.0, prev_found + minutes(1), true),
            ("miner-b", 9.0, FOUND - minutes(1), false),
            // After discovery: next round.
            ("miner-a", 4.0, FOUND + minutes(1), true),
        ]);

        let dist = store
            .transaction(|tx| {
                tx.insert_block(block(999, prev_found))?;
                proportional().distribute(tx, &block(1000, FOUND), FOUND)
            })
            .unwrap();

        assert_eq!(dist.credits.len(), 1);
        assert!((dist.credits["miner-b"] - 49.5).abs() < 1e-9);
        assert_eq!(dist.total_difficulty, 2.0);
    }

    #[test]
    fn lookback_applies_without_previous_block() {
        let store = store_with(&[
            ("miner-a", 1.0, FOUND - minutes(25 * 60), true),
            ("miner-b", 1.0, FOUND - minutes(23 * 60), true),
        ]);

        let dist = store
            .transaction(|tx| proportional().distribute(tx, &block(1000, FOUND), FOUND))
            .unwrap();

        assert_eq!(dist.credits.keys().collect::<Vec<_>>(), vec!["miner-b"]);
    }

    #[test]
    fn empty_round_credits_nobody() {
        let store = store_with(&[("miner-a", 1.0, FOUND - minutes(5), false)]);

        let dist = store
            .transaction(|tx| proportional().distribute(tx, &block(1000, FOUND), FOUND))
            .unwrap();

        assert!(dist.is_empty());
        assert!(store.read(|t| t.payments().is_empty()));
        assert_eq!(store.worker("miner-a").unwrap().pending_balance, 0.0);
    }

    #[test]
    fn pplns_takes_last_n_shares() {
        let prev_found = FOUND - minutes(10);
        let store = store_with(&[
            ("miner-a", 1.0, prev_found - minutes(5), true),
            ("miner-b", 1.0, prev_found - minutes(4), true),
            ("miner-b", 1.0, FOUND - minutes(3), true),
            ("miner-c", 1.0, FOUND + minutes(1), true),
        ]);
        let distributor = RewardDistributor::new(Box::new(TrailingShares { n: 2 }), 0.0);

        let dist = store
            .transaction(|tx| {
                tx.insert_block(block(999, prev_found))?;
                distributor.distribute(tx, &block(1000, FOUND), FOUND)
            })
            .unwrap();

        // The window reaches across the previous block but not past discovery.
        assert_eq!(dist.credits.len(), 1);
        assert!((dist.credits["miner-b"] - 50.0).abs() < 1e-9);
    }

    #[test]
    fn failure_later_in_transaction_rolls_back_credits() {
        let store = store_with(&[("miner-a", 1.0, FOUND - minutes(5), true)]);

        let result = store.transaction(|tx| {
            proportional().distribute(tx, &block(1000, FOUND), FOUND)?;
            tx.insert_block(block(1000, FOUND))?;
            tx.insert_block(block(1000, FOUND))
        });

        assert!(result.is_err());
        assert!(store.read(|t| t.payments().is_empty()));
        assert_eq!(store.worker("miner-a").unwrap().pending_balance, 0.0);
    }
}
