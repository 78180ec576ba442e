//! API data transfer objects.
//!
//! These types define the API contract shared between the server and
//! clients. Timestamps are Unix seconds.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Request for work on behalf of a payout address.
#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct WorkRequest {
    pub address: String,
}

/// Work assigned to a miner.
#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct WorkResponse {
    /// Daemon work template, passed through unchanged.
    #[schema(value_type = Object)]
    pub work: serde_json::Value,
    pub difficulty: f64,
    /// 256-bit share target, big-endian hex.
    pub share_target: String,
}

/// Solution submitted by a miner.
#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct SubmitRequest {
    pub address: String,
    /// Solved work data, as returned by the miner.
    pub data: String,
}

/// Classification of an accepted submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ShareOutcome {
    BlockFound,
    ValidShare,
    InvalidShare,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct SubmitResponse {
    pub outcome: ShareOutcome,
    /// True for `block_found` and `valid_share`.
    pub accepted: bool,
}

/// Combined work/submit request of the getwork protocol.
#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct GetworkRequest {
    pub address: String,
    /// Present when submitting a solution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// Getwork reply: work for a request, a verdict for a submission.
#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
#[serde(untagged)]
pub enum GetworkResponse {
    Work(WorkResponse),
    Result { result: bool },
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

/// Worker statistics.
#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct WorkerState {
    pub address: String,
    pub created_at: i64,
    pub last_seen: i64,
    pub total_shares: u64,
    pub valid_shares: u64,
    pub invalid_shares: u64,
    pub total_paid: f64,
    pub pending_balance: f64,
    pub difficulty: f64,
    /// Estimated hashrate in hashes per second.
    pub hashrate: f64,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct PaymentState {
    pub id: u64,
    pub amount: f64,
    pub block_height: u64,
    pub txid: Option<String>,
    pub timestamp: i64,
    /// `pending`, `confirmed` or `failed`.
    pub status: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct BlockState {
    pub height: u64,
    pub hash: String,
    pub prev_hash: String,
    pub timestamp: i64,
    pub difficulty: f64,
    pub reward: f64,
    pub finder: String,
    pub confirmations: u64,
    pub tx_count: u64,
}

/// Pool-wide statistics.
#[derive(Clone, Debug, Default, Deserialize, Serialize, ToSchema)]
pub struct PoolStats {
    pub total_workers: usize,
    /// Workers seen in the last 10 minutes.
    pub active_workers: usize,
    /// Aggregate hashrate in hashes per second.
    pub hashrate: f64,
    pub blocks_found: usize,
    pub total_paid: f64,
    pub pending_balance: f64,
    /// Seconds since the served work template was fetched.
    pub work_age_secs: Option<u64>,
    pub uptime_secs: u64,
}
