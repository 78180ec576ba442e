//! API v0 endpoints.
//!
//! Version 0 signals an unstable API -- breaking changes are expected
//! until the pool reaches 1.0.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use time::OffsetDateTime;
use utoipa::IntoParams;
use utoipa_axum::{router::OpenApiRouter, routes};

use super::server::SharedState;
use crate::api_client::types::{
    BlockState, ErrorResponse, GetworkRequest, GetworkResponse, PaymentState, PoolStats,
    ShareOutcome, SubmitRequest, SubmitResponse, WorkRequest, WorkResponse, WorkerState,
};
use crate::error::Error;
use crate::ledger::{Outcome, WorkAssignment, WorkRequestError};
use crate::store::{Block, Payment, Worker};
use crate::tracing::prelude::*;

/// Workers seen within this window count as active.
const ACTIVE_WINDOW: time::Duration = time::Duration::minutes(10);

const DEFAULT_BLOCK_LIMIT: usize = 50;
const MAX_BLOCK_LIMIT: usize = 500;

/// Build the v0 API routes with OpenAPI metadata.
pub fn routes() -> OpenApiRouter<SharedState> {
    OpenApiRouter::new()
        .routes(routes!(health))
        .routes(routes!(request_work))
        .routes(routes!(submit_work))
        .routes(routes!(getwork))
        .routes(routes!(get_worker))
        .routes(routes!(get_worker_payments))
        .routes(routes!(get_blocks))
        .routes(routes!(get_stats))
}

/// Error reply with a JSON body.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

impl From<WorkRequestError> for ApiError {
    fn from(err: WorkRequestError) -> Self {
        match err {
            WorkRequestError::InvalidAddress(address) => Self::new(
                StatusCode::BAD_REQUEST,
                format!("Invalid payout address: {address}"),
            ),
            WorkRequestError::NoWork => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "No work available")
            }
            WorkRequestError::Pool(e) => e.into(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        if err.is_retryable() {
            Self::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
        } else {
            error!(error = %err, "Request failed");
            Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

fn require_address(address: &str) -> Result<(), ApiError> {
    if address.trim().is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "Missing worker address"));
    }
    Ok(())
}

/// Map a ledger outcome to a reply. Unrecorded outcomes are errors.
fn classified(outcome: Outcome) -> Result<ShareOutcome, ApiError> {
    match outcome {
        Outcome::BlockFound => Ok(ShareOutcome::BlockFound),
        Outcome::ValidShare => Ok(ShareOutcome::ValidShare),
        Outcome::InvalidShare => Ok(ShareOutcome::InvalidShare),
        Outcome::UnknownWorker => Err(ApiError::new(StatusCode::NOT_FOUND, "Unknown worker")),
        Outcome::DaemonError(msg) => Err(ApiError::new(StatusCode::SERVICE_UNAVAILABLE, msg)),
    }
}

impl From<WorkAssignment> for WorkResponse {
    fn from(a: WorkAssignment) -> Self {
        Self {
            work: a.template.0,
            difficulty: a.difficulty.as_f64(),
            share_target: a.share_target,
        }
    }
}

impl From<&Worker> for WorkerState {
    fn from(w: &Worker) -> Self {
        Self {
            address: w.address.clone(),
            created_at: w.created_at.unix_timestamp(),
            last_seen: w.last_seen.unix_timestamp(),
            total_shares: w.total_shares,
            valid_shares: w.valid_shares,
            invalid_shares: w.invalid_shares,
            total_paid: w.total_paid,
            pending_balance: w.pending_balance,
            difficulty: w.difficulty.as_f64(),
            hashrate: w.hashrate.as_f64(),
        }
    }
}

impl From<&Payment> for PaymentState {
    fn from(p: &Payment) -> Self {
        Self {
            id: p.id,
            amount: p.amount,
            block_height: p.block_height,
            txid: p.txid.clone(),
            timestamp: p.timestamp.unix_timestamp(),
            status: p.status.to_string(),
        }
    }
}

impl From<&Block> for BlockState {
    fn from(b: &Block) -> Self {
        Self {
            height: b.height,
            hash: b.hash.clone(),
            prev_hash: b.prev_hash.clone(),
            timestamp: b.timestamp.unix_timestamp(),
            difficulty: b.difficulty,
            reward: b.reward,
            finder: b.finder.clone(),
            confirmations: b.confirmations,
            tx_count: b.tx_count,
        }
    }
}

/// Health check endpoint.
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = OK, description = "Server is running", body = String),
    ),
)]
async fn health() -> &'static str {
    "OK"
}

/// Obtain work. Registers the address on first use.
#[utoipa::path(
    post,
    path = "/work",
    tag = "work",
    request_body = WorkRequest,
    responses(
        (status = OK, description = "Current work", body = WorkResponse),
        (status = BAD_REQUEST, description = "Invalid payout address", body = ErrorResponse),
        (status = SERVICE_UNAVAILABLE, description = "No work available or daemon unreachable; retry later", body = ErrorResponse),
    ),
)]
async fn request_work(
    State(state): State<SharedState>,
    Json(req): Json<WorkRequest>,
) -> Result<Json<WorkResponse>, ApiError> {
    require_address(&req.address)?;
    let assignment = state.ledger.request_work(&req.address).await?;
    Ok(Json(assignment.into()))
}

/// Submit a solution for classification.
#[utoipa::path(
    post,
    path = "/submit",
    tag = "work",
    request_body = SubmitRequest,
    responses(
        (status = OK, description = "Solution classified", body = SubmitResponse),
        (status = BAD_REQUEST, description = "Missing address", body = ErrorResponse),
        (status = NOT_FOUND, description = "Unknown worker", body = ErrorResponse),
        (status = SERVICE_UNAVAILABLE, description = "Daemon could not classify the solution", body = ErrorResponse),
    ),
)]
async fn submit_work(
    State(state): State<SharedState>,
    Json(req): Json<SubmitRequest>,
) -> Result<Json<SubmitResponse>, ApiError> {
    require_address(&req.address)?;
    let outcome = classified(state.ledger.submit_share(&req.address, &req.data).await?)?;
    Ok(Json(SubmitResponse {
        outcome,
        accepted: outcome != ShareOutcome::InvalidShare,
    }))
}

/// Getwork protocol: request work without `data`, submit with it.
#[utoipa::path(
    post,
    path = "/getwork",
    tag = "work",
    request_body = GetworkRequest,
    responses(
        (status = OK, description = "Work, or the verdict on a submission", body = GetworkResponse),
        (status = BAD_REQUEST, description = "Missing or invalid address", body = ErrorResponse),
        (status = NOT_FOUND, description = "Unknown worker", body = ErrorResponse),
        (status = SERVICE_UNAVAILABLE, description = "No work available or daemon unreachable", body = ErrorResponse),
    ),
)]
async fn getwork(
    State(state): State<SharedState>,
    Json(req): Json<GetworkRequest>,
) -> Result<Json<GetworkResponse>, ApiError> {
    require_address(&req.address)?;
    match req.data {
        Some(data) => {
            let outcome = classified(state.ledger.submit_share(&req.address, &data).await?)?;
            Ok(Json(GetworkResponse::Result {
                result: outcome != ShareOutcome::InvalidShare,
            }))
        }
        None => {
            let assignment = state.ledger.request_work(&req.address).await?;
            Ok(Json(GetworkResponse::Work(assignment.into())))
        }
    }
}

/// Return a worker's statistics, or 404 if unknown.
#[utoipa::path(
    get,
    path = "/workers/{address}",
    tag = "workers",
    params(
        ("address" = String, Path, description = "Payout address"),
    ),
    responses(
        (status = OK, description = "Worker details", body = WorkerState),
        (status = NOT_FOUND, description = "Worker not found"),
    ),
)]
async fn get_worker(
    State(state): State<SharedState>,
    Path(address): Path<String>,
) -> Result<Json<WorkerState>, StatusCode> {
    state
        .store
        .worker(&address)
        .as_ref()
        .map(|w| Json(w.into()))
        .ok_or(StatusCode::NOT_FOUND)
}

/// Return a worker's payments, newest first.
#[utoipa::path(
    get,
    path = "/workers/{address}/payments",
    tag = "workers",
    params(
        ("address" = String, Path, description = "Payout address"),
    ),
    responses(
        (status = OK, description = "Payments", body = Vec<PaymentState>),
        (status = NOT_FOUND, description = "Worker not found"),
    ),
)]
async fn get_worker_payments(
    State(state): State<SharedState>,
    Path(address): Path<String>,
) -> Result<Json<Vec<PaymentState>>, StatusCode> {
    if state.store.worker(&address).is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(
        state
            .store
            .payments_for(&address)
            .iter()
            .map(PaymentState::from)
            .collect(),
    ))
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
struct BlocksQuery {
    /// Maximum number of blocks to return.
    limit: Option<usize>,
}

/// Return the most recent blocks found by the pool, newest first.
#[utoipa::path(
    get,
    path = "/blocks",
    tag = "blocks",
    params(BlocksQuery),
    responses(
        (status = OK, description = "Recent blocks", body = Vec<BlockState>),
    ),
)]
async fn get_blocks(
    State(state): State<SharedState>,
    Query(query): Query<BlocksQuery>,
) -> Json<Vec<BlockState>> {
    let limit = query.limit.unwrap_or(DEFAULT_BLOCK_LIMIT).min(MAX_BLOCK_LIMIT);
    Json(
        state
            .store
            .recent_blocks(limit)
            .iter()
            .map(BlockState::from)
            .collect(),
    )
}

/// Return pool-wide statistics.
#[utoipa::path(
    get,
    path = "/stats",
    tag = "pool",
    responses(
        (status = OK, description = "Pool statistics", body = PoolStats),
    ),
)]
async fn get_stats(State(state): State<SharedState>) -> Json<PoolStats> {
    let stats = state.store.stats(OffsetDateTime::now_utc() - ACTIVE_WINDOW);
    Json(PoolStats {
        total_workers: stats.total_workers,
        active_workers: stats.active_workers,
        hashrate: stats.total_hashrate.as_f64(),
        blocks_found: stats.blocks_found,
        total_paid: stats.total_paid,
        pending_balance: stats.pending_balance,
        work_age_secs: state.work.age().map(|age| age.as_secs()),
        uptime_secs: state.uptime_secs(),
    })
}
