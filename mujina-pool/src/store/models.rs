//! Persisted entities.
//!
//! The coordinator is the only writer. Every mutation goes through
//! [`Tx`](super::Tx); the dashboard and API only ever see owned copies.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::types::{Difficulty, HashRate};

/// A miner, identified by its payout address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub address: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    pub total_shares: u64,
    pub valid_shares: u64,
    pub invalid_shares: u64,
    pub total_paid: f64,
    pub pending_balance: f64,
    /// Share difficulty currently assigned.
    pub difficulty: Difficulty,
    pub hashrate: HashRate,
}

impl Worker {
    pub fn new(address: impl Into<String>, difficulty: Difficulty, now: OffsetDateTime) -> Self {
        Self {
            address: address.into(),
            created_at: now,
            last_seen: now,
            total_shares: 0,
            valid_shares: 0,
            invalid_shares: 0,
            total_paid: 0.0,
            pending_balance: 0.0,
            difficulty,
            hashrate: HashRate::ZERO,
        }
    }
}

/// One classified solution attempt. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Share {
    pub id: u64,
    pub worker: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub difficulty: Difficulty,
    pub valid: bool,
    /// Height of the block this share solved, filled in once the block is
    /// recorded.
    pub block_height: Option<u64>,
}

/// A block solved by the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub hash: String,
    pub prev_hash: String,
    /// Discovery time. Closes the block's round.
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub difficulty: f64,
    pub reward: f64,
    pub finder: String,
    pub confirmations: u64,
    pub tx_count: u64,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Confirmed,
    Failed,
}

/// One reward allocation to one worker for one block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: u64,
    pub worker: String,
    pub amount: f64,
    pub block_height: u64,
    /// Settlement transaction, set when the payout goes out.
    pub txid: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub status: PaymentStatus,
}

/// A block-solving share whose block has not been recorded yet.
///
/// Written in the same transaction as the share itself and removed in the
/// transaction that records the block, so a crash in between leaves a marker
/// the recovery pass can finish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingBlock {
    pub share_id: u64,
    pub finder: String,
    #[serde(with = "time::serde::rfc3339")]
    pub found_at: OffsetDateTime,
    /// Chain height the block was accepted at. The block is resolved at this
    /// height, never at whatever the tip is when recording finally succeeds.
    #[serde(default)]
    pub height: Option<u64>,
    pub attempts: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn payment_status_text_form() {
        assert_eq!(PaymentStatus::Pending.to_string(), "pending");
        assert_eq!(
            PaymentStatus::from_str("confirmed").unwrap(),
            PaymentStatus::Confirmed
        );
        assert_eq!(
            serde_json::to_string(&PaymentStatus::Failed).unwrap(),
            "\"failed\""
        );
    }

    #[test]
    fn worker_serializes_timestamps_as_rfc3339() {
        let worker = Worker::new(
            "miner-a",
            Difficulty::new(0.0001),
            time::macros::datetime!(2024-05-01 12:00 UTC),
        );
        let json = serde_json::to_value(&worker).unwrap();
        assert_eq!(json["last_seen"], "2024-05-01T12:00:00Z");
        assert_eq!(json["difficulty"], 0.0001);

        let back: Worker = serde_json::from_value(json).unwrap();
        assert_eq!(back, worker);
    }
}
