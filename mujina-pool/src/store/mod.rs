//! Transactional state store.
//!
//! All coordinator state lives in [`Tables`] behind one mutex. Writers go
//! through [`Store::transaction`], which hands a [`Tx`] to a synchronous
//! closure. Each mutation made through the `Tx` records how to undo itself;
//! if the closure returns an error the undo log is replayed in reverse, so a
//! transaction either applies completely or not at all.
//!
//! Transactions are synchronous on purpose: a closure cannot `.await`, so no
//! daemon call can ever run while the lock is held.
//!
//! Durability is optional. With a snapshot file configured, [`Store::flush`]
//! writes the committed state when it is dirty, and [`Store::commit_effect`]
//! writes it right after committing. Use the latter for anything that must
//! survive a crash once an external side effect (a block, a payout) has
//! happened. Either way the state is encoded under the lock and the file is
//! written on the blocking pool after the lock is released.

mod models;
mod snapshot;

use std::collections::BTreeMap;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub use models::{Block, Payment, PaymentStatus, PendingBlock, Share, Worker};
use snapshot::SnapshotFile;

use crate::error::{Error, Result};
use crate::tracing::prelude::*;
use crate::types::{Difficulty, HashRate};

/// Every table, as persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tables {
    workers: BTreeMap<String, Worker>,
    /// Append-only; a share's id is its index.
    shares: Vec<Share>,
    blocks: BTreeMap<u64, Block>,
    /// Append-only; a payment's id is its index.
    payments: Vec<Payment>,
    pending_blocks: Vec<PendingBlock>,
}

impl Tables {
    pub fn worker(&self, address: &str) -> Option<&Worker> {
        self.workers.get(address)
    }

    pub fn workers(&self) -> impl Iterator<Item = &Worker> {
        self.workers.values()
    }

    pub fn shares(&self) -> &[Share] {
        &self.shares
    }

    pub fn block(&self, height: u64) -> Option<&Block> {
        self.blocks.get(&height)
    }

    pub fn block_by_hash(&self, hash: &str) -> Option<&Block> {
        self.blocks.values().find(|b| b.hash == hash)
    }

    /// Highest block below `height`.
    pub fn block_before(&self, height: u64) -> Option<&Block> {
        self.blocks.range(..height).next_back().map(|(_, b)| b)
    }

    /// Blocks, newest first.
    pub fn blocks_desc(&self) -> impl Iterator<Item = &Block> {
        self.blocks.values().rev()
    }

    pub fn payments(&self) -> &[Payment] {
        &self.payments
    }

    pub fn payment(&self, id: u64) -> Option<&Payment> {
        self.payments.get(id as usize)
    }

    pub fn pending_blocks(&self) -> &[PendingBlock] {
        &self.pending_blocks
    }
}

/// Undo record for one mutation.
#[derive(Debug)]
enum Undo {
    Worker {
        address: String,
        previous: Option<Worker>,
    },
    ShareAppended,
    ShareBlock {
        id: u64,
        previous: Option<u64>,
    },
    BlockInserted(u64),
    PaymentAppended,
    Payment(Box<Payment>),
    PendingInserted,
    PendingRemoved {
        index: usize,
        pending: PendingBlock,
    },
    PendingUpdated(PendingBlock),
}

/// Write handle for one transaction.
///
/// Dereferences to [`Tables`] for reads, which observe the transaction's own
/// writes.
pub struct Tx<'a> {
    tables: &'a mut Tables,
    undo: Vec<Undo>,
}

impl Deref for Tx<'_> {
    type Target = Tables;

    fn deref(&self) -> &Tables {
        self.tables
    }
}

impl<'a> Tx<'a> {
    fn new(tables: &'a mut Tables) -> Self {
        Self {
            tables,
            undo: Vec::new(),
        }
    }

    pub fn insert_worker(&mut self, worker: Worker) -> Result<()> {
        if self.tables.workers.contains_key(&worker.address) {
            return Err(Error::PersistenceConflict(format!(
                "worker {} already exists",
                worker.address
            )));
        }
        self.undo.push(Undo::Worker {
            address: worker.address.clone(),
            previous: None,
        });
        self.tables.workers.insert(worker.address.clone(), worker);
        Ok(())
    }

    /// Mutate a worker in place.
    pub fn update_worker<T>(
        &mut self,
        address: &str,
        f: impl FnOnce(&mut Worker) -> T,
    ) -> Result<T> {
        let worker = self
            .tables
            .workers
            .get_mut(address)
            .ok_or_else(|| Error::UnknownWorker(address.to_string()))?;
        self.undo.push(Undo::Worker {
            address: address.to_string(),
            previous: Some(worker.clone()),
        });
        Ok(f(worker))
    }

    /// Append a share and return its id.
    pub fn insert_share(
        &mut self,
        worker: &str,
        timestamp: OffsetDateTime,
        difficulty: Difficulty,
        valid: bool,
    ) -> u64 {
        let id = self.tables.shares.len() as u64;
        self.tables.shares.push(Share {
            id,
            worker: worker.to_string(),
            timestamp,
            difficulty,
            valid,
            block_height: None,
        });
        self.undo.push(Undo::ShareAppended);
        id
    }

    /// Link a block-solving share to the block it solved.
    pub fn set_share_block(&mut self, id: u64, height: u64) -> Result<()> {
        let share = self
            .tables
            .shares
            .get_mut(id as usize)
            .ok_or_else(|| Error::Other(format!("no share {id}")))?;
        self.undo.push(Undo::ShareBlock {
            id,
            previous: share.block_height,
        });
        share.block_height = Some(height);
        Ok(())
    }

    /// Record a solved block. Height and hash are both unique.
    pub fn insert_block(&mut self, block: Block) -> Result<()> {
        if self.tables.blocks.contains_key(&block.height) {
            return Err(Error::PersistenceConflict(format!(
                "block {} already recorded",
                block.height
            )));
        }
        if self.tables.block_by_hash(&block.hash).is_some() {
            return Err(Error::PersistenceConflict(format!(
                "block hash {} already recorded",
                block.hash
            )));
        }
        self.undo.push(Undo::BlockInserted(block.height));
        self.tables.blocks.insert(block.height, block);
        Ok(())
    }

    /// Append a pending payment and return its id.
    pub fn insert_payment(
        &mut self,
        worker: &str,
        amount: f64,
        block_height: u64,
        timestamp: OffsetDateTime,
    ) -> u64 {
        let id = self.tables.payments.len() as u64;
        self.tables.payments.push(Payment {
            id,
            worker: worker.to_string(),
            amount,
            block_height,
            txid: None,
            timestamp,
            status: PaymentStatus::Pending,
        });
        self.undo.push(Undo::PaymentAppended);
        id
    }

    pub fn update_payment(&mut self, id: u64, f: impl FnOnce(&mut Payment)) -> Result<()> {
        let payment = self
            .tables
            .payments
            .get_mut(id as usize)
            .ok_or_else(|| Error::Other(format!("no payment {id}")))?;
        self.undo.push(Undo::Payment(Box::new(payment.clone())));
        f(payment);
        Ok(())
    }

    pub fn insert_pending_block(&mut self, pending: PendingBlock) {
        self.tables.pending_blocks.push(pending);
        self.undo.push(Undo::PendingInserted);
    }

    pub fn bump_pending_attempts(&mut self, share_id: u64) {
        if let Some(pending) = self
            .tables
            .pending_blocks
            .iter_mut()
            .find(|p| p.share_id == share_id)
        {
            self.undo.push(Undo::PendingUpdated(pending.clone()));
            pending.attempts += 1;
        }
    }

    pub fn remove_pending_block(&mut self, share_id: u64) -> Option<PendingBlock> {
        let index = self
            .tables
            .pending_blocks
            .iter()
            .position(|p| p.share_id == share_id)?;
        let pending = self.tables.pending_blocks.remove(index);
        self.undo.push(Undo::PendingRemoved {
            index,
            pending: pending.clone(),
        });
        Some(pending)
    }

    fn rollback(mut self) {
        while let Some(entry) = self.undo.pop() {
            match entry {
                Undo::Worker { address, previous } => match previous {
                    Some(worker) => {
                        self.tables.workers.insert(address, worker);
                    }
                    None => {
                        self.tables.workers.remove(&address);
                    }
                },
                Undo::ShareAppended => {
                    self.tables.shares.pop();
                }
                Undo::ShareBlock { id, previous } => {
                    if let Some(share) = self.tables.shares.get_mut(id as usize) {
                        share.block_height = previous;
                    }
                }
                Undo::BlockInserted(height) => {
                    self.tables.blocks.remove(&height);
                }
                Undo::PaymentAppended => {
                    self.tables.payments.pop();
                }
                Undo::Payment(previous) => {
                    let id = previous.id as usize;
                    if let Some(slot) = self.tables.payments.get_mut(id) {
                        *slot = *previous;
                    }
                }
                Undo::PendingInserted => {
                    self.tables.pending_blocks.pop();
                }
                Undo::PendingRemoved { index, pending } => {
                    self.tables.pending_blocks.insert(index, pending);
                }
                Undo::PendingUpdated(previous) => {
                    if let Some(slot) = self
                        .tables
                        .pending_blocks
                        .iter_mut()
                        .find(|p| p.share_id == previous.share_id)
                    {
                        *slot = previous;
                    }
                }
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.undo.is_empty()
    }
}

/// Aggregate pool figures for the stats endpoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolStats {
    pub total_workers: usize,
    pub active_workers: usize,
    pub total_hashrate: HashRate,
    pub blocks_found: usize,
    pub total_paid: f64,
    pub pending_balance: f64,
}

/// The single source of truth for coordinator state.
pub struct Store {
    tables: Mutex<Tables>,
    snapshot: Option<Arc<SnapshotFile>>,
    dirty: AtomicBool,
    /// Encodings handed out so far; orders snapshot writes.
    generation: AtomicU64,
}

/// A snapshot encoded under the lock, waiting to be written.
struct PendingWrite {
    file: Arc<SnapshotFile>,
    generation: u64,
    bytes: Vec<u8>,
}

impl Store {
    /// Store without durability. State is lost on exit.
    pub fn in_memory() -> Self {
        Self::with_tables(Tables::default(), None)
    }

    /// Store backed by a JSON snapshot file, loaded if it exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let tables = snapshot::load(&path)?.unwrap_or_default();
        Ok(Self::with_tables(
            tables,
            Some(Arc::new(SnapshotFile::new(path))),
        ))
    }

    fn with_tables(tables: Tables, snapshot: Option<Arc<SnapshotFile>>) -> Self {
        Self {
            tables: Mutex::new(tables),
            snapshot,
            dirty: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        }
    }

    /// Run `f` atomically. Any error rolls back every write it made.
    pub fn transaction<T>(&self, f: impl FnOnce(&mut Tx<'_>) -> Result<T>) -> Result<T> {
        let mut tables = self.tables.lock();
        let mut tx = Tx::new(&mut tables);
        match f(&mut tx) {
            Ok(value) => {
                if !tx.is_empty() {
                    self.dirty.store(true, Ordering::Release);
                }
                Ok(value)
            }
            Err(e) => {
                tx.rollback();
                Err(e)
            }
        }
    }

    /// Commit state that records an external side effect which already
    /// happened (a block accepted, a payout sent).
    ///
    /// Like [`transaction`](Self::transaction), but the state file is written
    /// before returning instead of at the next flush. A failed write is logged
    /// and the change stays committed in memory, dirty for the periodic flush.
    pub async fn commit_effect<T>(&self, f: impl FnOnce(&mut Tx<'_>) -> Result<T>) -> Result<T> {
        let (value, write) = {
            let mut tables = self.tables.lock();
            let mut tx = Tx::new(&mut tables);
            let value = match f(&mut tx) {
                Ok(value) => value,
                Err(e) => {
                    tx.rollback();
                    return Err(e);
                }
            };
            let write = match &self.snapshot {
                Some(file) if !tx.is_empty() => Some(self.prepare_write(file, &*tx.tables)),
                _ => None,
            };
            (value, write)
        };

        if let Some(write) = write {
            let result = match write {
                Ok(write) => self.write_out(write).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                error!(error = %e, "State file write failed; keeping change in memory");
            }
        }
        Ok(value)
    }

    /// Read-only access to a consistent view.
    /// Read-only access to a consistent view.
    pub fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> T {
        f(&self.tables.lock())
    }

    /// Write the snapshot if anything changed since the last write.
    pub async fn flush(&self) -> Result<()> {
        let Some(file) = &self.snapshot else {
            return Ok(());
        };
        let write = {
            let tables = self.tables.lock();
            if !self.dirty.load(Ordering::Acquire) {
                return Ok(());
            }
            self.prepare_write(file, &tables)?
        };
        self.write_out(write).await
    }

    /// Encode `tables` for writing once the lock is released. The caller
    /// holds the lock. Clears the dirty flag; a failed write sets it again.
    fn prepare_write(&self, file: &Arc<SnapshotFile>, tables: &Tables) -> Result<PendingWrite> {
        self.dirty.store(false, Ordering::Release);
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        match snapshot::encode(tables) {
            Ok(bytes) => Ok(PendingWrite {
                file: file.clone(),
                generation,
                bytes,
            }),
            Err(e) => {
                self.dirty.store(true, Ordering::Release);
                Err(e)
            }
        }
    }

    async fn write_out(&self, write: PendingWrite) -> Result<()> {
        let PendingWrite {
            file,
            generation,
            bytes,
        } = write;
        let result = tokio::task::spawn_blocking(move || {
            file.write(generation, &bytes)
                .map_err(|e| Error::Persistence(format!("{}: {e}", file.path().display())))
        })
        .await
        .unwrap_or_else(|e| Err(Error::Persistence(format!("state file writer failed: {e}"))));

        if result.is_err() {
            self.dirty.store(true, Ordering::Release);
        }
        result
    }

    pub fn worker(&self, address: &str) -> Option<Worker> {
        self.read(|t| t.worker(address).cloned())
    }

    pub fn workers(&self) -> Vec<Worker> {
        self.read(|t| t.workers().cloned().collect())
    }

    /// Most recent blocks, newest first.
    pub fn recent_blocks(&self, limit: usize) -> Vec<Block> {
        self.read(|t| t.blocks_desc().take(limit).cloned().collect())
    }

    /// A worker's payments, newest first.
    pub fn payments_for(&self, address: &str) -> Vec<Payment> {
        self.read(|t| {
            t.payments()
                .iter()
                .rev()
                .filter(|p| p.worker == address)
                .cloned()
                .collect()
        })
    }

    /// A worker's most recent shares, newest first.
    pub fn recent_shares_for(&self, address: &str, limit: usize) -> Vec<Share> {
        self.read(|t| {
            t.shares()
                .iter()
                .rev()
                .filter(|s| s.worker == address)
                .take(limit)
                .cloned()
                .collect()
        })
    }

    pub fn pending_blocks(&self) -> Vec<PendingBlock> {
        self.read(|t| t.pending_blocks().to_vec())
    }

    /// Pool totals. Workers seen since `active_since` count as active.
    pub fn stats(&self, active_since: OffsetDateTime) -> PoolStats {
        self.read(|t| PoolStats {
            total_workers: t.workers.len(),
            active_workers: t.workers().filter(|w| w.last_seen >= active_since).count(),
            total_hashrate: t.workers().map(|w| w.hashrate).sum(),
            blocks_found: t.blocks.len(),
            total_paid: t.workers().map(|w| w.total_paid).sum(),
            pending_balance: t.workers().map(|w| w.pending_balance).sum(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const T0: OffsetDateTime = datetime!(2024-05-01 12:00 UTC);

    fn store_with_worker(address: &str) -> Store {
        let store = Store::in_memory();
        store
            .transaction(|tx| tx.insert_worker(Worker::new(address, Difficulty::new(1.0), T0)))
            .unwrap();
        store
    }

    fn block(height: u64, hash: &str) -> Block {
        Block {
            height,
            hash: hash.to_string(),
            prev_hash: String::new(),
            timestamp: T0,
            difficulty: 1.0,
            reward: 50.0,
            finder: "miner-a".into(),
            confirmations: 0,
            tx_count: 1,
        }
    }

    #[test]
    fn committed_writes_are_visible() {
        let store = store_with_worker("miner-a");
        store
            .transaction(|tx| {
                tx.insert_share("miner-a", T0, Difficulty::new(1.0), true);
                tx.update_worker("miner-a", |w| w.valid_shares += 1)
            })
            .unwrap();

        assert_eq!(store.worker("miner-a").unwrap().valid_shares, 1);
        assert_eq!(store.read(|t| t.shares().len()), 1);
    }

    #[test]
    fn failed_transaction_rolls_back_everything() {
        let store = store_with_worker("miner-a");
        let before = store.read(|t| t.clone());

        let result: Result<()> = store.transaction(|tx| {
            tx.insert_share("miner-a", T0, Difficulty::new(1.0), true);
            tx.update_worker("miner-a", |w| {
                w.valid_shares += 1;
                w.pending_balance += 3.0;
            })?;
            tx.insert_block(block(1000, "aa"))?;
            let id = tx.insert_payment("miner-a", 3.0, 1000, T0);
            tx.update_payment(id, |p| p.status = PaymentStatus::Confirmed)?;
            tx.insert_pending_block(PendingBlock {
                share_id: 0,
                finder: "miner-a".into(),
                found_at: T0,
                height: None,
                attempts: 0,
            });
            tx.insert_worker(Worker::new("miner-b", Difficulty::new(1.0), T0))?;
            Err(Error::Other("boom".into()))
        });

        assert!(result.is_err());
        let after = store.read(|t| t.clone());
        assert_eq!(after.workers, before.workers);
        assert!(after.shares.is_empty());
        assert!(after.blocks.is_empty());
        assert!(after.payments.is_empty());
        assert!(after.pending_blocks.is_empty());
    }

    #[test]
    fn rollback_restores_removed_pending_block_in_place() {
        let store = store_with_worker("miner-a");
        store
            .transaction(|tx| {
                for share_id in 0..3 {
                    tx.insert_pending_block(PendingBlock {
                        share_id,
                        finder: "miner-a".into(),
                        found_at: T0,
                        height: None,
                        attempts: 0,
                    });
                }
                Ok(())
            })
            .unwrap();

        let _ = store.transaction(|tx| -> Result<()> {
            tx.remove_pending_block(1);
            tx.bump_pending_attempts(2);
            Err(Error::Other("boom".into()))
        });

        let pending = store.pending_blocks();
        let ids: Vec<u64> = pending.iter().map(|p| p.share_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(pending[2].attempts, 0);
    }

    #[test]
    fn duplicate_block_is_a_conflict() {
        let store = Store::in_memory();
        store.transaction(|tx| tx.insert_block(block(1000, "aa"))).unwrap();

        let err = store
            .transaction(|tx| tx.insert_block(block(1000, "bb")))
            .unwrap_err();
        assert!(matches!(err, Error::PersistenceConflict(_)));

        let err = store
            .transaction(|tx| tx.insert_block(block(1001, "aa")))
            .unwrap_err();
        assert!(matches!(err, Error::PersistenceConflict(_)));
    }

    #[test]
    fn update_of_missing_worker_is_unknown_worker() {
        let store = Store::in_memory();
        let err = store
            .transaction(|tx| tx.update_worker("ghost", |w| w.valid_shares += 1))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownWorker(_)));
    }

    #[test]
    fn block_before_finds_previous_height() {
        let store = Store::in_memory();
        store
            .transaction(|tx| {
                tx.insert_block(block(990, "a"))?;
                tx.insert_block(block(995, "b"))?;
                tx.insert_block(block(1000, "c"))
            })
            .unwrap();

        store.read(|t| {
            assert_eq!(t.block_before(1000).map(|b| b.height), Some(995));
            assert_eq!(t.block_before(990).map(|b| b.height), None);
        });
        let recent: Vec<u64> = store.recent_blocks(2).iter().map(|b| b.height).collect();
        assert_eq!(recent, vec![1000, 995]);
    }

    #[test]
    fn stats_count_active_workers() {
        let store = Store::in_memory();
        store
            .transaction(|tx| {
                tx.insert_worker(Worker::new("old", Difficulty::new(1.0), T0))?;
                let mut fresh = Worker::new("fresh", Difficulty::new(1.0), T0);
                fresh.last_seen = T0 + time::Duration::minutes(30);
                fresh.total_paid = 2.5;
                tx.insert_worker(fresh)
            })
            .unwrap();

        let stats = store.stats(T0 + time::Duration::minutes(20));
        assert_eq!(stats.total_workers, 2);
        assert_eq!(stats.active_workers, 1);
        assert_eq!(stats.total_paid, 2.5);
    }

    #[tokio::test]
    async fn snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        {
            let store = Store::open(&path).unwrap();
            store
                .commit_effect(|tx| {
                    tx.insert_worker(Worker::new("miner-a", Difficulty::new(1.0), T0))
                })
                .await
                .unwrap();
            store
                .transaction(|tx| tx.update_worker("miner-a", |w| w.valid_shares = 7))
                .unwrap();
            store.flush().await.unwrap();
        }

        let reopened = Store::open(&path).unwrap();
        assert_eq!(reopened.worker("miner-a").unwrap().valid_shares, 7);
    }

    #[tokio::test]
    async fn committed_effect_is_on_disk_without_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = Store::open(&path).unwrap();

        store
            .commit_effect(|tx| tx.insert_worker(Worker::new("miner-a", Difficulty::new(1.0), T0)))
            .await
            .unwrap();

        // No flush: reopening reads what a crash would leave behind.
        let reopened = Store::open(&path).unwrap();
        assert!(reopened.worker("miner-a").is_some());
    }

    #[tokio::test]
    async fn failed_effect_rolls_back_and_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = Store::open(&path).unwrap();

        let result: Result<()> = store
            .commit_effect(|tx| {
                tx.insert_worker(Worker::new("miner-a", Difficulty::new(1.0), T0))?;
                Err(Error::Other("boom".into()))
            })
            .await;

        assert!(result.is_err());
        assert!(store.worker("miner-a").is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn unwritable_state_file_keeps_effect_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be makes the rename fail.
        let path = dir.path().join("state.json");
        std::fs::create_dir_all(path.join("occupied")).unwrap();
        let store = Store::with_tables(Tables::default(), Some(Arc::new(SnapshotFile::new(path))));

        store
            .commit_effect(|tx| tx.insert_worker(Worker::new("miner-a", Difficulty::new(1.0), T0)))
            .await
            .unwrap();

        assert!(store.worker("miner-a").is_some());
        assert!(store.flush().await.is_err());
    }

    #[tokio::test]
    async fn flush_skips_clean_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = Store::open(&path).unwrap();

        store.flush().await.unwrap();
        assert!(!path.exists());

        store
            .transaction(|tx| tx.insert_worker(Worker::new("miner-a", Difficulty::new(1.0), T0)))
            .unwrap();
        store.flush().await.unwrap();
        assert!(path.exists());
    }
}
