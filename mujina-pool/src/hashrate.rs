//! Per-worker hashrate estimation.
//!
//! The share ledger sends every accepted share to the estimator over a
//! channel. The estimator keeps a trailing window of `(timestamp, difficulty)`
//! per worker and periodically writes
//!
//! ```text
//! hashrate = Σ difficulty × 2^32 / (now − oldest share in window)
//! ```
//!
//! to each worker. A worker whose window has emptied is written as zero.
//! The windows are derived state only; the share log in the store stays
//! authoritative, and the windows are refilled from it on construction so a
//! restart keeps reporting workers that are still mining.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::store::Store;
use crate::tracing::prelude::*;
use crate::types::{Difficulty, HashRate};

/// An accepted share, as seen by the estimator.
#[derive(Debug, Clone)]
pub struct ShareEvent {
    pub worker: String,
    pub difficulty: Difficulty,
    pub timestamp: OffsetDateTime,
}

/// Sending half handed to the share ledger.
#[derive(Debug, Clone)]
pub struct ShareEvents(mpsc::UnboundedSender<ShareEvent>);

impl ShareEvents {
    /// Report an accepted share. Dropped silently once the estimator is gone.
    pub fn accepted(&self, worker: &str, difficulty: Difficulty, timestamp: OffsetDateTime) {
        let _ = self.0.send(ShareEvent {
            worker: worker.to_string(),
            difficulty,
            timestamp,
        });
    }
}

pub struct HashrateEstimator {
    store: Arc<Store>,
    events: mpsc::UnboundedReceiver<ShareEvent>,
    windows: HashMap<String, VecDeque<(OffsetDateTime, Difficulty)>>,
    window: Duration,
    interval: Duration,
}

impl HashrateEstimator {
    /// Create before anything can submit shares: valid shares already in the
    /// store and inside the window seed the estimator, later ones arrive as
    /// events.
    pub fn new(store: Arc<Store>, window: Duration, interval: Duration) -> (Self, ShareEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut estimator = Self {
            store,
            events: rx,
            windows: HashMap::new(),
            window,
            interval,
        };
        estimator.seed(OffsetDateTime::now_utc() - window);
        (estimator, ShareEvents(tx))
    }

    fn seed(&mut self, since: OffsetDateTime) {
        let windows = &mut self.windows;
        self.store.read(|t| {
            for share in t.shares().iter().filter(|s| s.valid && s.timestamp >= since) {
                windows
                    .entry(share.worker.clone())
                    .or_default()
                    .push_back((share.timestamp, share.difficulty));
            }
        });
        if !windows.is_empty() {
            debug!(workers = windows.len(), "Hashrate windows seeded from share log");
        }
    }

    /// Take in queued share events, prune the windows and write every
    /// worker's hashrate as of `now`.
    pub fn recompute(&mut self, now: OffsetDateTime) -> Result<HashMap<String, HashRate>> {
        while let Ok(event) = self.events.try_recv() {
            self.windows
                .entry(event.worker)
                .or_default()
                .push_back((event.timestamp, event.difficulty));
        }

        let cutoff = now - self.window;
        let mut rates = HashMap::with_capacity(self.windows.len());
        self.windows.retain(|worker, window| {
            while window.front().is_some_and(|(ts, _)| *ts < cutoff) {
                window.pop_front();
            }
            let rate = match window.front() {
                Some((oldest, _)) => {
                    let work: Difficulty = window.iter().map(|(_, d)| *d).sum();
                    HashRate::from_work(work, (now - *oldest).unsigned_abs())
                }
                None => HashRate::ZERO,
            };
            rates.insert(worker.clone(), rate);
            !window.is_empty()
        });

        self.store.transaction(|tx| {
            let stale: Vec<String> = tx
                .workers()
                .filter(|w| !w.hashrate.is_zero() && !rates.contains_key(&w.address))
                .map(|w| w.address.clone())
                .collect();
            for address in stale {
                tx.update_worker(&address, |w| w.hashrate = HashRate::ZERO)?;
            }
            for (address, rate) in &rates {
                if tx.worker(address).is_some() {
                    tx.update_worker(address, |w| w.hashrate = *rate)?;
                }
            }
            Ok(())
        })?;

        Ok(rates)
    }

    /// Workers with a non-empty window.
    pub fn tracked_workers(&self) -> usize {
        self.windows.len()
    }

    /// Recompute on a fixed interval until cancelled.
    pub async fn run(mut self, cancellation: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancellation.cancelled() => {
                    break;
                }
                _ = interval.tick() => {
                    match self.recompute(OffsetDateTime::now_utc()) {
                        Ok(rates) => {
                            let total: HashRate = rates.values().copied().sum();
                            debug!(workers = rates.len(), %total, "Hashrate recomputed");
                        }
                        Err(e) => warn!(error = %e, "Hashrate recomputation failed"),
                    }
                }
            }
        }
        debug!("Hashrate estimator stopped");
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::store::Worker;

    const T0: OffsetDateTime = datetime!(2024-05-01 12:00 UTC);

    fn setup(addresses: &[&str]) -> (Arc<Store>, HashrateEstimator, ShareEvents) {
        let store = Arc::new(Store::in_memory());
        store
            .transaction(|tx| {
                for address in addresses {
                    tx.insert_worker(Worker::new(*address, Difficulty::new(1.0), T0))?;
                }
                Ok(())
            })
            .unwrap();
        let (estimator, events) = HashrateEstimator::new(
            store.clone(),
            Duration::from_secs(600),
            Duration::from_secs(60),
        );
        (store, estimator, events)
    }

    fn secs(n: i64) -> time::Duration {
        time::Duration::seconds(n)
    }

    #[test]
    fn five_unit_shares_over_window_span() {
        let (store, mut estimator, events) = setup(&["miner-a"]);
        for i in 0..5 {
            events.accepted("miner-a", Difficulty::new(1.0), T0 + secs(i * 10));
        }

        let now = T0 + secs(60);
        let rates = estimator.recompute(now).unwrap();

        let expected = 5.0 * 4_294_967_296.0 / 60.0;
        assert!((rates["miner-a"].as_f64() - expected).abs() < 1e-3);
        assert_eq!(store.worker("miner-a").unwrap().hashrate, rates["miner-a"]);
    }

    #[test]
    fn decays_to_zero_once_window_empties() {
        let (store, mut estimator, events) = setup(&["miner-a"]);
        events.accepted("miner-a", Difficulty::new(2.0), T0);

        estimator.recompute(T0 + secs(300)).unwrap();
        assert!(!store.worker("miner-a").unwrap().hashrate.is_zero());

        let rates = estimator.recompute(T0 + secs(601)).unwrap();
        assert_eq!(rates["miner-a"], HashRate::ZERO);
        assert_eq!(store.worker("miner-a").unwrap().hashrate, HashRate::ZERO);
        assert_eq!(estimator.tracked_workers(), 0);
    }

    #[test]
    fn old_shares_leave_the_window() {
        let (_store, mut estimator, events) = setup(&["miner-a"]);
        events.accepted("miner-a", Difficulty::new(100.0), T0);
        events.accepted("miner-a", Difficulty::new(1.0), T0 + secs(500));

        let rates = estimator.recompute(T0 + secs(700)).unwrap();

        // Only the second share remains; span is 200s.
        let expected = 4_294_967_296.0 / 200.0;
        assert!((rates["miner-a"].as_f64() - expected).abs() < 1e-3);
    }

    #[test]
    fn untracked_worker_with_stale_rate_is_zeroed() {
        let (store, mut estimator, _events) = setup(&["miner-a"]);
        store
            .transaction(|tx| {
                tx.update_worker("miner-a", |w| {
                    w.hashrate = HashRate::from_hashes_per_sec(1e9)
                })
            })
            .unwrap();

        estimator.recompute(T0).unwrap();

        assert_eq!(store.worker("miner-a").unwrap().hashrate, HashRate::ZERO);
    }

    #[test]
    fn restart_seeds_windows_from_share_log() {
        let store = Arc::new(Store::in_memory());
        let now = OffsetDateTime::now_utc();
        store
            .transaction(|tx| {
                tx.insert_worker(Worker::new("miner-a", Difficulty::new(1.0), T0))?;
                tx.insert_share("miner-a", now - secs(3600), Difficulty::new(50.0), true);
                tx.insert_share("miner-a", now - secs(200), Difficulty::new(1.0), true);
                tx.insert_share("miner-a", now - secs(150), Difficulty::new(9.0), false);
                tx.insert_share("miner-a", now - secs(100), Difficulty::new(1.0), true);
                Ok(())
            })
            .unwrap();

        let (mut estimator, _events) = HashrateEstimator::new(
            store.clone(),
            Duration::from_secs(600),
            Duration::from_secs(60),
        );
        assert_eq!(estimator.tracked_workers(), 1);

        let rates = estimator.recompute(now).unwrap();

        let expected = 2.0 * 4_294_967_296.0 / 200.0;
        assert!((rates["miner-a"].as_f64() - expected).abs() < 1e-3);
        assert_eq!(store.worker("miner-a").unwrap().hashrate, rates["miner-a"]);
    }

    #[test]
    fn workers_are_independent() {
        let (store, mut estimator, events) = setup(&["miner-a", "miner-b"]);
        events.accepted("miner-a", Difficulty::new(1.0), T0);
        events.accepted("miner-b", Difficulty::new(4.0), T0);

        let rates = estimator.recompute(T0 + secs(100)).unwrap();

        assert!((rates["miner-b"].as_f64() / rates["miner-a"].as_f64() - 4.0).abs() < 1e-9);
        assert_eq!(store.worker("miner-b").unwrap().hashrate, rates["miner-b"]);
    }
}
