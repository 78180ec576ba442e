//! Payout dispatcher.
//!
//! Periodically pays every worker whose pending balance reached the payout
//! threshold, in a single batched daemon transaction. Settlement captures
//! the exact balances and payment rows that were sent, so rewards credited
//! while the batch is in flight stay pending for the next sweep.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::backoff::ExponentialBackoff;
use crate::daemon::{Daemon, round_to_base_units};
use crate::error::Result;
use crate::store::{PaymentStatus, Store, Tables, Tx};
use crate::tracing::prelude::*;

/// Longest delay between sweeps while the daemon keeps refusing.
const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

/// Consecutive failed sweeps before the failure is logged as an error.
const ESCALATE_AFTER_FAILURES: u32 = 12;

/// Leftovers below half a base unit cannot be paid and count as settled.
const DUST: f64 = 0.5e-8;

/// What one sweep did.
#[derive(Debug, Clone, PartialEq)]
pub enum SweepOutcome {
    /// No balance reached the threshold.
    Idle,
    Paid {
        txid: String,
        workers: usize,
        total: f64,
    },
}

#[derive(Debug)]
struct Payee {
    address: String,
    amount: f64,
    payment_ids: Vec<u64>,
}

pub struct PayoutDispatcher {
    store: Arc<Store>,
    daemon: Arc<dyn Daemon>,
    threshold: f64,
    interval: Duration,
}

impl PayoutDispatcher {
    pub fn new(store: Arc<Store>, daemon: Arc<dyn Daemon>, threshold: f64, interval: Duration) -> Self {
        Self {
            store,
            daemon,
            threshold,
            interval,
        }
    }

    /// Pay every worker at or above the threshold.
    ///
    /// A daemon failure is returned unchanged and leaves every balance and
    /// payment exactly as it was.
    pub async fn sweep(&self) -> Result<SweepOutcome> {
        let payees = self.store.read(|t| select_payees(t, self.threshold));
        if payees.is_empty() {
            return Ok(SweepOutcome::Idle);
        }

        let amounts: BTreeMap<String, f64> = payees
            .iter()
            .map(|p| (p.address.clone(), p.amount))
            .collect();
        let total: f64 = amounts.values().sum();

        let txid = self.daemon.send_batch_payment(&amounts).await?;

        self.store
            .commit_effect(|tx| settle(tx, &payees, &txid))
            .await?;

        info!(%txid, workers = payees.len(), total, "Payout sent");
        Ok(SweepOutcome::Paid {
            txid,
            workers: payees.len(),
            total,
        })
    }

    /// Sweep on the configured interval until cancelled, backing off while
    /// the daemon keeps failing.
    pub async fn run(self, cancellation: CancellationToken) {
        let mut backoff = ExponentialBackoff::new(self.interval, MAX_BACKOFF.max(self.interval));
        let mut delay = self.interval;

        loop {
            tokio::select! {
                _ = cancellation.cancelled() => {
                    break;
                }
                _ = tokio::time::sleep(delay) => {
                    delay = match self.sweep().await {
                        Ok(outcome) => {
                            if backoff.is_backing_off() {
                                info!(failures = backoff.failures(), "Payouts recovered");
                            }
                            backoff.success();
                            if outcome == SweepOutcome::Idle {
                                trace!("No balances due");
                            }
                            self.interval
                        }
                        Err(e) => {
                            let next = backoff.failure();
                            let failures = backoff.failures();
                            if failures >= ESCALATE_AFTER_FAILURES {
                                error!(failures, error = %e, retry_in = ?next, "Payouts keep failing");
                            } else {
                                warn!(failures, error = %e, retry_in = ?next, "Payout failed");
                            }
                            next
                        }
                    };
                }
            }
        }
        debug!("Payout dispatcher stopped");
    }
}

/// Amounts are rounded to base units here, so settlement records exactly
/// what the daemon sends.
fn select_payees(tables: &Tables, threshold: f64) -> Vec<Payee> {
    tables
        .workers()
        .filter(|w| w.pending_balance >= threshold)
        .map(|w| (w, round_to_base_units(w.pending_balance)))
        .filter(|(_, amount)| *amount > 0.0)
        .map(|(w, amount)| Payee {
            address: w.address.clone(),
            amount,
            payment_ids: tables
                .payments()
                .iter()
                .filter(|p| p.worker == w.address && p.status == PaymentStatus::Pending)
                .map(|p| p.id)
                .collect(),
        })
        .collect()
}

fn settle(tx: &mut Tx<'_>, payees: &[Payee], txid: &str) -> Result<()> {
    for payee in payees {
        tx.update_worker(&payee.address, |w| {
            w.pending_balance -= payee.amount;
            if w.pending_balance.abs() < DUST {
                w.pending_balance = 0.0;
            }
            w.total_paid += payee.amount;
        })?;
        for id in &payee.payment_ids {
            tx.update_payment(*id, |p| {
                p.status = PaymentStatus::Confirmed;
                p.txid = Some(txid.to_string());
            })?;
        }
    }
    Ok(())
}
