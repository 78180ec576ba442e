//! Daemon adapter.
//!
//! The blockchain daemon is the only party that verifies proof-of-work,
//! builds blocks and signs payment transactions. The coordinator talks to it
//! through the narrow [`Daemon`] trait. Every call returns an explicit
//! `Result` so a failed round trip can never be mistaken for a negative
//! answer: "address invalid" is `Ok(false)`, "daemon down" is
//! `Err(DaemonError::Unavailable)`.
//!
//! Implementations:
//! - [`rpc::RpcDaemon`]: JSON-RPC over HTTP with basic auth.
//! - [`dummy::DummyDaemon`]: in-process daemon for development and tests.
//!
//! Wrap either in [`Timed`] so that no call can stall the coordinator.

pub mod dummy;
pub mod rpc;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Daemon-issued unit of mining work.
///
/// Opaque to the coordinator: the payload is passed through to miners
/// unchanged. Replaced wholesale on every refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkTemplate(pub serde_json::Value);

impl WorkTemplate {
    pub fn payload(&self) -> &serde_json::Value {
        &self.0
    }

    /// Height of the block this template builds, when the daemon reports it.
    pub fn height(&self) -> Option<u64> {
        self.0.get("height").and_then(serde_json::Value::as_u64)
    }
}

/// Decimal places of the daemon's base unit.
pub const AMOUNT_DECIMALS: i32 = 8;

/// Round `amount` to the daemon's base unit.
pub fn round_to_base_units(amount: f64) -> f64 {
    let scale = 10f64.powi(AMOUNT_DECIMALS);
    (amount * scale).round() / scale
}

/// Daemon classification of a submitted solution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Solution meets the network target: a block was found.
    BlockAccepted,
    /// Valid share below the network target.
    ShareAccepted,
    /// Daemon refused the solution.
    Rejected,
}

/// Details of a block as reported by the daemon.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockDetails {
    pub height: u64,
    pub hash: String,
    pub prev_hash: String,
    pub difficulty: f64,
    /// Block subsidy plus fees, when the daemon reports it.
    pub reward: Option<f64>,
    pub tx_count: u64,
}

/// Failure of a daemon call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DaemonError {
    /// Transport failure, timeout or authentication failure.
    #[error("daemon unreachable: {0}")]
    Unavailable(String),

    /// The daemon returned a JSON-RPC error object.
    #[error("daemon error {code}: {message}")]
    Rejected { code: i64, message: String },

    /// The reply did not have the expected shape.
    #[error("unexpected daemon reply: {0}")]
    Protocol(String),
}

/// The coordinator's view of the blockchain daemon.
#[async_trait]
pub trait Daemon: Send + Sync {
    /// Current work template, or `None` when the daemon has nothing to hand out.
    async fn get_work_template(&self) -> Result<Option<WorkTemplate>, DaemonError>;

    /// Submit a solution for classification.
    async fn submit_work(&self, solution: &str) -> Result<SubmitOutcome, DaemonError>;

    async fn get_block_count(&self) -> Result<u64, DaemonError>;

    async fn get_block_hash(&self, height: u64) -> Result<String, DaemonError>;

    async fn get_block_details(&self, hash: &str) -> Result<BlockDetails, DaemonError>;

    /// Whether `address` is a valid payout address.
    async fn validate_address(&self, address: &str) -> Result<bool, DaemonError>;

    /// Pay every address in one transaction. Returns the transaction id.
    async fn send_batch_payment(
        &self,
        amounts: &BTreeMap<String, f64>,
    ) -> Result<String, DaemonError>;
}

#[async_trait]
impl<D: Daemon + ?Sized> Daemon for Arc<D> {
    async fn get_work_template(&self) -> Result<Option<WorkTemplate>, DaemonError> {
        (**self).get_work_template().await
    }

    async fn submit_work(&self, solution: &str) -> Result<SubmitOutcome, DaemonError> {
        (**self).submit_work(solution).await
    }

    async fn get_block_count(&self) -> Result<u64, DaemonError> {
        (**self).get_block_count().await
    }

    async fn get_block_hash(&self, height: u64) -> Result<String, DaemonError> {
        (**self).get_block_hash(height).await
    }

    async fn get_block_details(&self, hash: &str) -> Result<BlockDetails, DaemonError> {
        (**self).get_block_details(hash).await
    }

    async fn validate_address(&self, address: &str) -> Result<bool, DaemonError> {
        (**self).validate_address(address).await
    }

    async fn send_batch_payment(
        &self,
        amounts: &BTreeMap<String, f64>,
    ) -> Result<String, DaemonError> {
        (**self).send_batch_payment(amounts).await
    }
}

/// Bounds every call of the wrapped daemon with a timeout.
///
/// Expiry is reported as [`DaemonError::Unavailable`]. The inner future is
/// dropped on expiry; for the RPC client that abandons the HTTP request.
pub struct Timed<D> {
    inner: D,
    timeout: Duration,
}

impl<D: Daemon> Timed<D> {
    pub fn new(inner: D, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    async fn bounded<T>(
        &self,
        call: &'static str,
        fut: impl Future<Output = Result<T, DaemonError>> + Send,
    ) -> Result<T, DaemonError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(DaemonError::Unavailable(format!(
                "{call} timed out after {:?}",
                self.timeout
            ))),
        }
    }
}

#[async_trait]
impl<D: Daemon> Daemon for Timed<D> {
    async fn get_work_template(&self) -> Result<Option<WorkTemplate>, DaemonError> {
        self.bounded("getwork", self.inner.get_work_template()).await
    }

    async fn submit_work(&self, solution: &str) -> Result<SubmitOutcome, DaemonError> {
        self.bounded("getwork submit", self.inner.submit_work(solution)).await
    }

    async fn get_block_count(&self) -> Result<u64, DaemonError> {
        self.bounded("getblockcount", self.inner.get_block_count()).await
    }

    async fn get_block_hash(&self, height: u64) -> Result<String, DaemonError> {
        self.bounded("getblockhash", self.inner.get_block_hash(height)).await
    }

    async fn get_block_details(&self, hash: &str) -> Result<BlockDetails, DaemonError> {
        self.bounded("getblock", self.inner.get_block_details(hash)).await
    }

    async fn validate_address(&self, address: &str) -> Result<bool, DaemonError> {
        self.bounded("validateaddress", self.inner.validate_address(address)).await
    }

    async fn send_batch_payment(
        &self,
        amounts: &BTreeMap<String, f64>,
    ) -> Result<String, DaemonError> {
        self.bounded("sendmany", self.inner.send_batch_payment(amounts)).await
    }
}

#[cfg(test)]
mod tests {
    use super::dummy::DummyDaemon;
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn timed_reports_hung_call_as_unavailable() {
        let dummy = Arc::new(DummyDaemon::new());
        dummy.set_hang_submit(true);
        let daemon = Timed::new(dummy.clone(), Duration::from_secs(5));

        let err = daemon.submit_work("00ff").await.unwrap_err();
        assert!(matches!(err, DaemonError::Unavailable(_)), "got {err:?}");
    }

    #[test]
    fn template_height_is_optional() {
        let template = WorkTemplate(serde_json::json!({"data": "00", "height": 1000}));
        assert_eq!(template.height(), Some(1000));
        let template = WorkTemplate(serde_json::json!({"data": "00"}));
        assert_eq!(template.height(), None);
    }

    #[test]
    fn amounts_round_to_base_units() {
        assert_eq!(round_to_base_units(14.850000000000001), 14.85);
        assert_eq!(round_to_base_units(0.123456789), 0.12345679);
        assert_eq!(round_to_base_units(0.000000004), 0.0);
    }

    #[tokio::test]
    async fn timed_passes_through_results() {
        let dummy = Arc::new(DummyDaemon::new());
        dummy.push_submit(SubmitOutcome::BlockAccepted);
        let daemon = Timed::new(dummy.clone(), Duration::from_secs(5));

        assert_eq!(
            daemon.submit_work("00ff").await,
            Ok(SubmitOutcome::BlockAccepted)
        );
        assert_eq!(daemon.validate_address("miner-a").await, Ok(true));
    }
}
