//! Background task supervision.
//!
//! [`Coordinator`] wires the pool components together. Starting it hands
//! the timer-driven work to a [`Supervisor`], which owns the tasks'
//! lifecycle:
//!
//! - work cache refresh
//! - hashrate recomputation
//! - payout sweeps
//! - pending block recovery (at startup, then on the payout interval)
//! - state file flush
//!
//! Stopping cancels every task; each exits at its next wake, after any
//! daemon call in progress has completed or timed out.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::PoolConfig;
use crate::daemon::{Daemon, Timed};
use crate::hashrate::HashrateEstimator;
use crate::ledger::ShareLedger;
use crate::payout::PayoutDispatcher;
use crate::rewards::{self, RewardDistributor};
use crate::store::Store;
use crate::tracing::prelude::*;
use crate::work::WorkCache;

const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// The pool components, wired and ready to start.
pub struct Coordinator {
    pub store: Arc<Store>,
    pub work: Arc<WorkCache>,
    pub ledger: Arc<ShareLedger>,
    estimator: HashrateEstimator,
    payout: PayoutDispatcher,
    recovery_interval: Duration,
}

impl Coordinator {
    /// Every daemon call made by the coordinator is bounded by
    /// `config.rpc_timeout`.
    pub fn new(config: &PoolConfig, daemon: Arc<dyn Daemon>, store: Arc<Store>) -> Self {
        let daemon: Arc<dyn Daemon> = Arc::new(Timed::new(daemon, config.rpc_timeout));

        let work = Arc::new(WorkCache::new(daemon.clone(), config.work_refresh_interval));
        let (estimator, share_events) = HashrateEstimator::new(
            store.clone(),
            config.hashrate_window,
            config.hashrate_interval,
        );
        let distributor = RewardDistributor::new(
            rewards::from_scheme(config.reward_scheme, config.round_lookback),
            config.pool_fee,
        );
        let ledger = Arc::new(ShareLedger::new(
            store.clone(),
            daemon.clone(),
            work.clone(),
            distributor,
            share_events,
            config.min_difficulty,
            config.block_reward,
        ));
        let payout = PayoutDispatcher::new(
            store.clone(),
            daemon,
            config.payout_threshold,
            config.payout_interval,
        );

        Self {
            store,
            work,
            ledger,
            estimator,
            payout,
            recovery_interval: config.payout_interval,
        }
    }

    /// Spawn the background tasks.
    pub fn start(self) -> Supervisor {
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();

        tracker.spawn(self.work.clone().run(cancel.child_token()));
        tracker.spawn(self.estimator.run(cancel.child_token()));
        tracker.spawn(self.payout.run(cancel.child_token()));
        tracker.spawn(recover_blocks(
            self.ledger.clone(),
            self.recovery_interval,
            cancel.child_token(),
        ));
        tracker.spawn(flush_state(self.store.clone(), cancel.child_token()));
        tracker.close();

        info!("Pool coordinator started");
        Supervisor { tracker, cancel }
    }
}

/// Handle on the running background tasks.
pub struct Supervisor {
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Supervisor {
    /// Ask every task to stop. Returns immediately.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Token cancelled when the supervisor stops; for sibling services.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait until every task has exited.
    pub async fn wait(&self) {
        self.tracker.wait().await;
    }

    /// Stop and wait.
    pub async fn shutdown(self) {
        self.stop();
        self.wait().await;
        info!("Pool coordinator stopped");
    }
}

async fn recover_blocks(ledger: Arc<ShareLedger>, every: Duration, cancellation: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancellation.cancelled() => {
                break;
            }
            _ = interval.tick() => {
                ledger.recover_pending_blocks().await;
            }
        }
    }
}

async fn flush_state(store: Arc<Store>, cancellation: CancellationToken) {
    let mut interval = tokio::time::interval(FLUSH_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancellation.cancelled() => {
                break;
            }
            _ = interval.tick() => {
                if let Err(e) = store.flush().await {
                    warn!(error = %e, "State flush failed");
                }
            }
        }
    }

    if let Err(e) = store.flush().await {
        error!(error = %e, "Final state flush failed");
    }
}
