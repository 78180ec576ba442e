//! Share ledger.
//!
//! The only writer of workers, shares and blocks. Handles both halves of
//! the work protocol:
//!
//! - [`ShareLedger::request_work`] registers a worker on first contact, once
//!   the daemon has validated its payout address, and hands out a copy of the
//!   current template.
//! - [`ShareLedger::submit_share`] asks the daemon to classify a solution
//!   and records the result.
//!
//! A solved block is recorded in two steps. The solving share is stored
//! together with a [`PendingBlock`] marker carrying the height the block was
//! accepted at, and written to the state file at once. The block at that
//! height is then looked up on the daemon and recorded, distributed and
//! unmarked in one transaction. A marker left behind by a failed lookup or a
//! crash is retried by [`ShareLedger::recover_pending_blocks`].
//!
//! Shares are timestamped inside the transaction that stores them, so share
//! order matches commit order and no share can land in a round that has
//! already been distributed.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use time::OffsetDateTime;

use crate::daemon::{BlockDetails, Daemon, DaemonError, SubmitOutcome, WorkTemplate};
use crate::error::{Error, Result};
use crate::hashrate::ShareEvents;
use crate::rewards::{Distribution, RewardDistributor};
use crate::store::{Block, PendingBlock, Store, Tx, Worker};
use crate::tracing::prelude::*;
use crate::types::Difficulty;
use crate::work::WorkCache;

/// Classification of a submitted solution.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The solution solved a block.
    BlockFound,
    /// Valid share below the network target.
    ValidShare,
    /// The daemon rejected the solution.
    InvalidShare,
    /// No worker is registered under the address. Nothing was recorded.
    UnknownWorker,
    /// The daemon could not classify the solution. Nothing was recorded.
    DaemonError(String),
}

impl Outcome {
    /// Whether the share counts as accepted work.
    pub fn is_accepted(&self) -> bool {
        matches!(self, Outcome::BlockFound | Outcome::ValidShare)
    }
}

/// Work handed to a miner.
#[derive(Debug, Clone)]
pub struct WorkAssignment {
    pub template: WorkTemplate,
    pub difficulty: Difficulty,
    /// Big-endian hex share target for `difficulty`.
    pub share_target: String,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkRequestError {
    #[error("invalid payout address: {0:?}")]
    InvalidAddress(String),

    /// Retryable: the cache has no template yet.
    #[error("no work available")]
    NoWork,

    #[error(transparent)]
    Pool(#[from] Error),
}

impl From<DaemonError> for WorkRequestError {
    fn from(err: DaemonError) -> Self {
        Self::Pool(err.into())
    }
}

pub struct ShareLedger {
    store: Arc<Store>,
    daemon: Arc<dyn Daemon>,
    work: Arc<WorkCache>,
    distributor: RewardDistributor,
    share_events: ShareEvents,
    min_difficulty: Difficulty,
    /// Reward used when the daemon does not report one.
    block_reward: f64,
    /// Pending blocks currently being recorded, by share id.
    recording: Mutex<HashSet<u64>>,
}

impl ShareLedger {
    pub fn new(
        store: Arc<Store>,
        daemon: Arc<dyn Daemon>,
        work: Arc<WorkCache>,
        distributor: RewardDistributor,
        share_events: ShareEvents,
        min_difficulty: Difficulty,
        block_reward: f64,
    ) -> Self {
        Self {
            store,
            daemon,
            work,
            distributor,
            share_events,
            min_difficulty,
            block_reward,
            recording: Mutex::new(HashSet::new()),
        }
    }

    /// Register `address` if needed and return the current work.
    ///
    /// Unknown addresses are validated with the daemon before a worker is
    /// created. The worker's last-seen time is updated even when no work is
    /// available.
    pub async fn request_work(
        &self,
        address: &str,
    ) -> std::result::Result<WorkAssignment, WorkRequestError> {
        let address = address.trim();
        if address.is_empty() {
            return Err(WorkRequestError::InvalidAddress(address.to_string()));
        }

        if self.store.worker(address).is_none() && !self.daemon.validate_address(address).await? {
            debug!(address, "Work request with invalid address");
            return Err(WorkRequestError::InvalidAddress(address.to_string()));
        }

        let min_difficulty = self.min_difficulty;
        let (difficulty, created) = self.store.transaction(|tx| {
            let now = OffsetDateTime::now_utc();
            if tx.worker(address).is_some() {
                let difficulty = tx.update_worker(address, |w| {
                    w.last_seen = now;
                    w.difficulty
                })?;
                Ok((difficulty, false))
            } else {
                tx.insert_worker(Worker::new(address, min_difficulty, now))?;
                Ok((min_difficulty, true))
            }
        })?;
        if created {
            info!(address, %difficulty, "Worker registered");
        }

        let template = self.work.current().ok_or(WorkRequestError::NoWork)?;
        Ok(WorkAssignment {
            template,
            difficulty,
            share_target: difficulty.share_target_hex(),
        })
    }

    /// Classify and record a solution from `address`.
    ///
    /// Only persistence failures are returned as errors; daemon failures
    /// become [`Outcome::DaemonError`] and leave every counter untouched.
    pub async fn submit_share(&self, address: &str, solution: &str) -> Result<Outcome> {
        if self.store.worker(address).is_none() {
            return Ok(Outcome::UnknownWorker);
        }

        let classified = match self.daemon.submit_work(solution).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(address, error = %e, "Share could not be classified");
                return Ok(Outcome::DaemonError(e.to_string()));
            }
        };
        let outcome = match classified {
            SubmitOutcome::BlockAccepted => Outcome::BlockFound,
            SubmitOutcome::ShareAccepted => Outcome::ValidShare,
            SubmitOutcome::Rejected => Outcome::InvalidShare,
        };
        let valid = outcome.is_accepted();
        let block_found = outcome == Outcome::BlockFound;
        let expected_height = if block_found {
            self.accepted_height().await
        } else {
            None
        };

        let record = |tx: &mut Tx<'_>| -> Result<Recorded> {
            let now = OffsetDateTime::now_utc();
            let difficulty = tx.update_worker(address, |w| {
                w.total_shares += 1;
                if valid {
                    w.valid_shares += 1;
                } else {
                    w.invalid_shares += 1;
                }
                w.last_seen = now;
                w.difficulty
            })?;
            let share_id = tx.insert_share(address, now, difficulty, valid);
            let pending = block_found.then(|| PendingBlock {
                share_id,
                finder: address.to_string(),
                found_at: now,
                height: expected_height,
                attempts: 0,
            });
            if let Some(pending) = &pending {
                tx.insert_pending_block(pending.clone());
            }
            Ok(Recorded {
                share_id,
                difficulty,
                timestamp: now,
                pending,
            })
        };
        // The daemon already holds the block, so its marker goes to disk now.
        let recorded = if block_found {
            self.store.commit_effect(record).await?
        } else {
            self.store.transaction(record)?
        };
        let share_id = recorded.share_id;

        match outcome {
            Outcome::InvalidShare => debug!(address, "Share rejected"),
            Outcome::BlockFound => info!(address, share_id, height = ?expected_height, "Block found"),
            _ => trace!(address, share_id, "Share accepted"),
        }

        if valid {
            self.share_events
                .accepted(address, recorded.difficulty, recorded.timestamp);
        }

        if let Some(pending) = recorded.pending {
            if let Err(e) = self.record_block(&pending).await {
                warn!(share_id, error = %e, "Block recording deferred to recovery");
            }
        }

        Ok(outcome)
    }

    /// Retry every pending block marker. Returns how many blocks were
    /// recorded.
    pub async fn recover_pending_blocks(&self) -> usize {
        let pending = self.store.pending_blocks();
        if pending.is_empty() {
            return 0;
        }

        let mut recorded = 0;
        for marker in &pending {
            match self.record_block(marker).await {
                Ok(Some(_)) => recorded += 1,
                Ok(None) => {}
                Err(e) => warn!(
                    share_id = marker.share_id,
                    attempts = marker.attempts + 1,
                    error = %e,
                    "Pending block still unrecorded"
                ),
            }
        }
        if recorded > 0 {
            info!(recorded, "Recovered pending blocks");
        }
        recorded
    }

    /// Look up the block solved by `pending`, record it and distribute its
    /// reward.
    ///
    /// Returns `Ok(None)` when another task is recording the same marker, or
    /// the block was already recorded (the marker is then cleared without a
    /// second distribution).
    pub async fn record_block(&self, pending: &PendingBlock) -> Result<Option<Block>> {
        let Some(_claim) = Claim::new(&self.recording, pending.share_id) else {
            return Ok(None);
        };

        let details = match self.resolve(pending.height).await {
            Ok(details) => details,
            Err(e) => {
                self.store.transaction(|tx| {
                    tx.bump_pending_attempts(pending.share_id);
                    Ok(())
                })?;
                return Err(e.into());
            }
        };

        let block = Block {
            height: details.height,
            hash: details.hash,
            prev_hash: details.prev_hash,
            timestamp: pending.found_at,
            difficulty: details.difficulty,
            reward: details.reward.unwrap_or(self.block_reward),
            finder: pending.finder.clone(),
            confirmations: 0,
            tx_count: details.tx_count,
        };

        let result = self
            .store
            .commit_effect(|tx| -> Result<Option<Distribution>> {
                if tx.block(block.height).is_some() || tx.block_by_hash(&block.hash).is_some() {
                    tx.remove_pending_block(pending.share_id);
                    return Ok(None);
                }
                tx.insert_block(block.clone())?;
                tx.set_share_block(pending.share_id, block.height)?;
                let distribution =
                    self.distributor
                        .distribute(tx, &block, OffsetDateTime::now_utc())?;
                tx.remove_pending_block(pending.share_id);
                Ok(Some(distribution))
            })
            .await?;

        match result {
            Some(distribution) => {
                info!(
                    height = block.height,
                    hash = %block.hash,
                    finder = %block.finder,
                    reward = block.reward,
                    workers = distribution.credits.len(),
                    "Block recorded"
                );
                Ok(Some(block))
            }
            None => {
                warn!(
                    height = block.height,
                    share_id = pending.share_id,
                    "Block already recorded; clearing duplicate marker"
                );
                Ok(None)
            }
        }
    }

    /// Height a just-accepted block landed at: the tip right after
    /// acceptance, else the height the current template builds.
    async fn accepted_height(&self) -> Option<u64> {
        match self.daemon.get_block_count().await {
            Ok(height) => Some(height),
            Err(e) => {
                let height = self.work.current().and_then(|t| t.height());
                warn!(error = %e, ?height, "Block count unavailable; using template height");
                height
            }
        }
    }

    /// The block at `height`. Without a known height, the current tip.
    async fn resolve(&self, height: Option<u64>) -> std::result::Result<BlockDetails, DaemonError> {
        let height = match height {
            Some(height) => height,
            None => self.daemon.get_block_count().await?,
        };
        let hash = self.daemon.get_block_hash(height).await?;
        self.daemon.get_block_details(&hash).await
    }
}

/// What one submission wrote.
struct Recorded {
    share_id: u64,
    difficulty: Difficulty,
    timestamp: OffsetDateTime,
    pending: Option<PendingBlock>,
}

/// Exclusive claim on a pending block, released on drop.
struct Claim<'a> {
    set: &'a Mutex<HashSet<u64>>,
    share_id: u64,
}

impl<'a> Claim<'a> {
    fn new(set: &'a Mutex<HashSet<u64>>, share_id: u64) -> Option<Self> {
        set.lock().insert(share_id).then_some(Self { set, share_id })
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.share_id);
    }
}
