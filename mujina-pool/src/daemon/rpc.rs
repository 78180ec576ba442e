//! JSON-RPC daemon client.
//!
//! Speaks bitcoind-style JSON-RPC 1.0 over HTTP with basic auth. The daemon
//! reports RPC-level failures both in the body and as HTTP 500, so the body is
//! always parsed before the status is considered.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use super::{
    BlockDetails, Daemon, DaemonError, SubmitOutcome, WorkTemplate, round_to_base_units,
};
use crate::tracing::prelude::*;

/// Connection settings for [`RpcDaemon`].
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Endpoint, e.g. `http://127.0.0.1:62620`.
    pub url: String,
    pub user: String,
    pub password: String,
    /// Whole-request timeout enforced by the HTTP client.
    pub timeout: Duration,
}

/// Daemon reached over JSON-RPC.
pub struct RpcDaemon {
    http: reqwest::Client,
    config: RpcConfig,
    next_id: AtomicU64,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

impl RpcDaemon {
    pub fn new(config: RpcConfig) -> Result<Self, DaemonError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("mujina-pool/", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout)
            .connect_timeout(config.timeout.min(Duration::from_secs(5)))
            .build()
            .map_err(|e| DaemonError::Unavailable(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            http,
            config,
            next_id: AtomicU64::new(1),
        })
    }

    /// Send one request and return the raw `result` value.
    async fn call_raw(&self, method: &str, params: Value) -> Result<Value, DaemonError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "1.0",
            "id": id,
            "method": method,
            "params": params,
        });

        trace!(method, id, "RPC request");

        let response = self
            .http
            .post(&self.config.url)
            .basic_auth(&self.config.user, Some(&self.config.password))
            .json(&body)
            .send()
            .await
            .map_err(|e| DaemonError::Unavailable(format!("{method}: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(DaemonError::Unavailable(format!(
                "{method}: authentication failed (HTTP {status})"
            )));
        }

        let text = response
            .text()
            .await
            .map_err(|e| DaemonError::Unavailable(format!("{method}: {e}")))?;

        let reply: RpcResponse = serde_json::from_str(&text).map_err(|e| {
            DaemonError::Protocol(format!("{method}: invalid JSON-RPC reply (HTTP {status}): {e}"))
        })?;

        if let Some(err) = reply.error {
            return Err(DaemonError::Rejected {
                code: err.code,
                message: err.message,
            });
        }

        Ok(reply.result)
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, DaemonError> {
        let result = self.call_raw(method, params).await?;
        serde_json::from_value(result)
            .map_err(|e| DaemonError::Protocol(format!("{method}: unexpected result: {e}")))
    }
}

/// Map the `getwork` submission result onto an explicit outcome.
///
/// `true` means the solution met the network target, `false` means it was
/// accepted as a share. Anything else is a rejection.
fn classify_submission(result: &Value) -> SubmitOutcome {
    match result {
        Value::Bool(true) => SubmitOutcome::BlockAccepted,
        Value::Bool(false) => SubmitOutcome::ShareAccepted,
        _ => SubmitOutcome::Rejected,
    }
}

/// JSON-RPC error codes by which the daemon refuses the solution itself.
/// Any other error code describes the daemon's own state (not connected,
/// initial block download, warming up) and is not the worker's fault.
const SOLUTION_REJECTION_CODES: &[i64] = &[
    -8,  // invalid parameter: malformed solution data
    -22, // solution could not be decoded
    -25, // block verification failed
    -26, // block rejected
    -27, // block already in chain
];

/// Map an error reply to a `getwork` submission.
fn classify_submission_error(err: DaemonError) -> Result<SubmitOutcome, DaemonError> {
    match err {
        DaemonError::Rejected { code, message } if SOLUTION_REJECTION_CODES.contains(&code) => {
            debug!(code, %message, "Daemon refused solution");
            Ok(SubmitOutcome::Rejected)
        }
        DaemonError::Rejected { code, message } => Err(DaemonError::Unavailable(format!(
            "getwork submit: daemon error {code}: {message}"
        ))),
        other => Err(other),
    }
}

fn parse_block_details(value: &Value) -> Result<BlockDetails, DaemonError> {
    let obj = value
        .as_object()
        .ok_or_else(|| DaemonError::Protocol("getblock: result is not an object".into()))?;

    let height = obj
        .get("height")
        .and_then(Value::as_u64)
        .ok_or_else(|| DaemonError::Protocol("getblock: missing height".into()))?;
    let hash = obj
        .get("hash")
        .and_then(Value::as_str)
        .ok_or_else(|| DaemonError::Protocol("getblock: missing hash".into()))?
        .to_string();
    let prev_hash = obj
        .get("previousblockhash")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let difficulty = obj.get("difficulty").and_then(Value::as_f64).unwrap_or(0.0);
    let reward = obj.get("reward").and_then(Value::as_f64);
    let tx_count = obj
        .get("tx")
        .and_then(Value::as_array)
        .map(|txs| txs.len() as u64)
        .or_else(|| obj.get("nTx").and_then(Value::as_u64))
        .unwrap_or(0);

    Ok(BlockDetails {
        height,
        hash,
        prev_hash,
        difficulty,
        reward,
        tx_count,
    })
}

/// Amounts go on the wire with at most eight decimals; the daemon refuses
/// more precision than its base unit.
fn wire_amounts(amounts: &BTreeMap<String, f64>) -> serde_json::Map<String, Value> {
    amounts
        .iter()
        .map(|(address, amount)| (address.clone(), json!(round_to_base_units(*amount))))
        .collect()
}

#[async_trait]
impl Daemon for RpcDaemon {
    async fn get_work_template(&self) -> Result<Option<WorkTemplate>, DaemonError> {
        let result = self.call_raw("getwork", json!([])).await?;
        Ok(match result {
            Value::Null => None,
            value => Some(WorkTemplate(value)),
        })
    }

    async fn submit_work(&self, solution: &str) -> Result<SubmitOutcome, DaemonError> {
        match self.call_raw("getwork", json!([solution])).await {
            Ok(result) => Ok(classify_submission(&result)),
            Err(e) => classify_submission_error(e),
        }
    }

    async fn get_block_count(&self) -> Result<u64, DaemonError> {
        self.call("getblockcount", json!([])).await
    }

    async fn get_block_hash(&self, height: u64) -> Result<String, DaemonError> {
        self.call("getblockhash", json!([height])).await
    }

    async fn get_block_details(&self, hash: &str) -> Result<BlockDetails, DaemonError> {
        let result = self.call_raw("getblock", json!([hash])).await?;
        parse_block_details(&result)
    }

    async fn validate_address(&self, address: &str) -> Result<bool, DaemonError> {
        let result = self.call_raw("validateaddress", json!([address])).await?;
        result
            .get("isvalid")
            .and_then(Value::as_bool)
            .ok_or_else(|| DaemonError::Protocol("validateaddress: missing isvalid".into()))
    }

    async fn send_batch_payment(
        &self,
        amounts: &BTreeMap<String, f64>,
    ) -> Result<String, DaemonError> {
        let result = self
            .call_raw("sendmany", json!(["", wire_amounts(amounts)]))
            .await?;
        match result {
            Value::String(txid) if !txid.is_empty() => Ok(txid),
            other => Err(DaemonError::Protocol(format!(
                "sendmany: expected txid, got {other}"
            ))),
        }
    }
}
