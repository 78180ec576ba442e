//! Mining pool coordinator.
//!
//! Hands out daemon work to miners, classifies their solutions through the
//! daemon, estimates per-worker hashrate, splits block rewards across each
//! round's contributors and pays balances out in batches.

pub mod api;
pub mod api_client;
pub mod backoff;
pub mod config;
pub mod daemon;
pub mod error;
pub mod hashrate;
pub mod ledger;
pub mod payout;
pub mod rewards;
pub mod scheduler;
pub mod store;
pub mod tracing;
pub mod types;
pub mod work;
