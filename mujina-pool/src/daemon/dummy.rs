//! In-process daemon.
//!
//! Stands in for a real node during development (`MUJINA_POOL_DAEMON=dummy`)
//! and in tests. Behaviour is scriptable: queue submission outcomes, make the
//! daemon unreachable, hang submissions, refuse addresses or fail payment
//! batches.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use super::{BlockDetails, Daemon, DaemonError, SubmitOutcome, WorkTemplate};

const DEFAULT_REWARD: f64 = 50.0;
const GENESIS_HEIGHT: u64 = 999;

#[derive(Debug)]
struct DummyState {
    unreachable: bool,
    no_work: bool,
    hang_submit: bool,
    lookups_down: bool,
    template_seq: u64,
    submissions: u64,
    scripted: VecDeque<SubmitOutcome>,
    /// Every n-th submission solves a block when nothing is scripted.
    block_interval: Option<u64>,
    height: u64,
    reward: Option<f64>,
    blocks: HashMap<String, BlockDetails>,
    invalid_addresses: HashSet<String>,
    payment_failures: usize,
    payments: Vec<BTreeMap<String, f64>>,
}

/// Scriptable in-process daemon.
#[derive(Debug)]
pub struct DummyDaemon {
    state: Mutex<DummyState>,
}

impl Default for DummyDaemon {
    fn default() -> Self {
        Self::new()
    }
}

impl DummyDaemon {
    /// Accepts every solution as a share and every address as valid.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DummyState {
                unreachable: false,
                no_work: false,
                hang_submit: false,
                lookups_down: false,
                template_seq: 0,
                submissions: 0,
                scripted: VecDeque::new(),
                block_interval: None,
                height: GENESIS_HEIGHT,
                reward: Some(DEFAULT_REWARD),
                blocks: HashMap::new(),
                invalid_addresses: HashSet::new(),
                payment_failures: 0,
                payments: Vec::new(),
            }),
        }
    }

    /// Solve a block every `interval` submissions.
    pub fn with_block_interval(interval: u64) -> Self {
        let daemon = Self::new();
        daemon.state.lock().block_interval = Some(interval.max(1));
        daemon
    }

    /// Queue the outcome of the next unscripted submission.
    pub fn push_submit(&self, outcome: SubmitOutcome) {
        self.state.lock().scripted.push_back(outcome);
    }

    /// Fail every call with [`DaemonError::Unavailable`].
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    /// Report no work available.
    pub fn set_no_work(&self, no_work: bool) {
        self.state.lock().no_work = no_work;
    }

    /// Never answer `submit_work`.
    pub fn set_hang_submit(&self, hang: bool) {
        self.state.lock().hang_submit = hang;
    }

    /// Fail block lookups while leaving submissions working.
    pub fn set_lookups_down(&self, down: bool) {
        self.state.lock().lookups_down = down;
    }

    /// Extend the chain with a block found elsewhere.
    pub fn advance_chain(&self) {
        Self::solve_block(&mut self.state.lock());
    }

    pub fn reject_address(&self, address: &str) {
        self.state.lock().invalid_addresses.insert(address.to_string());
    }

    /// Reward reported for newly solved blocks; `None` omits the field.
    pub fn set_block_reward(&self, reward: Option<f64>) {
        self.state.lock().reward = reward;
    }

    /// Fail the next `count` payment batches.
    pub fn fail_payments(&self, count: usize) {
        self.state.lock().payment_failures = count;
    }

    /// Payment batches accepted so far.
    pub fn payments(&self) -> Vec<BTreeMap<String, f64>> {
        self.state.lock().payments.clone()
    }

    pub fn submissions(&self) -> u64 {
        self.state.lock().submissions
    }

    pub fn height(&self) -> u64 {
        self.state.lock().height
    }

    fn check_reachable(state: &DummyState) -> Result<(), DaemonError> {
        if state.unreachable {
            Err(DaemonError::Unavailable("dummy daemon unreachable".into()))
        } else {
            Ok(())
        }
    }

    fn check_lookups(state: &DummyState) -> Result<(), DaemonError> {
        Self::check_reachable(state)?;
        if state.lookups_down {
            return Err(DaemonError::Unavailable("dummy block index offline".into()));
        }
        Ok(())
    }

    fn solve_block(state: &mut DummyState) {
        let prev_hash = block_hash(state.height);
        state.height += 1;
        let hash = block_hash(state.height);
        state.blocks.insert(
            hash.clone(),
            BlockDetails {
                height: state.height,
                hash,
                prev_hash,
                difficulty: 1.0,
                reward: state.reward,
                tx_count: 1,
            },
        );
    }
}

fn block_hash(height: u64) -> String {
    format!("{height:064x}")
}

#[async_trait]
impl Daemon for DummyDaemon {
    async fn get_work_template(&self) -> Result<Option<WorkTemplate>, DaemonError> {
        let mut state = self.state.lock();
        Self::check_reachable(&state)?;
        if state.no_work {
            return Ok(None);
        }
        state.template_seq += 1;
        Ok(Some(WorkTemplate(json!({
            "data": format!("{:0>256x}", state.template_seq),
            "target": "ffffffffffffffffffffffffffffffffffffffffffffffffffffffff00000000",
            "height": state.height + 1,
        }))))
    }

    async fn submit_work(&self, _solution: &str) -> Result<SubmitOutcome, DaemonError> {
        let hang = {
            let mut state = self.state.lock();
            Self::check_reachable(&state)?;
            state.submissions += 1;
            state.hang_submit
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let mut state = self.state.lock();
        let outcome = match state.scripted.pop_front() {
            Some(outcome) => outcome,
            None => match state.block_interval {
                Some(n) if state.submissions % n == 0 => SubmitOutcome::BlockAccepted,
                _ => SubmitOutcome::ShareAccepted,
            },
        };
        if outcome == SubmitOutcome::BlockAccepted {
            Self::solve_block(&mut state);
        }
        Ok(outcome)
    }

    async fn get_block_count(&self) -> Result<u64, DaemonError> {
        let state = self.state.lock();
        Self::check_lookups(&state)?;
        Ok(state.height)
    }

    async fn get_block_hash(&self, height: u64) -> Result<String, DaemonError> {
        let state = self.state.lock();
        Self::check_lookups(&state)?;
        if height > state.height {
            return Err(DaemonError::Rejected {
                code: -8,
                message: "Block height out of range".into(),
            });
        }
        Ok(block_hash(height))
    }

    async fn get_block_details(&self, hash: &str) -> Result<BlockDetails, DaemonError> {
        let state = self.state.lock();
        Self::check_lookups(&state)?;
        state
            .blocks
            .get(hash)
            .cloned()
            .ok_or_else(|| DaemonError::Rejected {
                code: -5,
                message: "Block not found".into(),
            })
    }

    async fn validate_address(&self, address: &str) -> Result<bool, DaemonError> {
        let state = self.state.lock();
        Self::check_reachable(&state)?;
        Ok(!address.is_empty() && !state.invalid_addresses.contains(address))
    }

    async fn send_batch_payment(
        &self,
        amounts: &BTreeMap<String, f64>,
    ) -> Result<String, DaemonError> {
        let mut state = self.state.lock();
        Self::check_reachable(&state)?;
        if state.payment_failures > 0 {
            state.payment_failures -= 1;
            return Err(DaemonError::Rejected {
                code: -6,
                message: "Insufficient funds".into(),
            });
        }
        state.payments.push(amounts.clone());
        Ok(format!("{:064x}", 0xfeed_0000_u64 + state.payments.len() as u64))
    }
}
