//! Pool coordinator daemon.
//!
//! Loads configuration from `MUJINA_POOL_*` environment variables, starts
//! the background tasks and serves the HTTP API until SIGINT or SIGTERM.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{SignalKind, signal};

use mujina_pool::api::{self, SharedState};
use mujina_pool::config::{DaemonKind, PoolConfig};
use mujina_pool::daemon::Daemon;
use mujina_pool::daemon::dummy::DummyDaemon;
use mujina_pool::daemon::rpc::{RpcConfig, RpcDaemon};
use mujina_pool::scheduler::Coordinator;
use mujina_pool::store::Store;
use mujina_pool::tracing::{self, prelude::*};

#[tokio::main]
async fn main() -> Result<()> {
    tracing::init();

    let config = PoolConfig::from_env().context("invalid configuration")?;

    let daemon: Arc<dyn Daemon> = match config.daemon {
        DaemonKind::Rpc => {
            info!(url = %config.rpc_url, "Using JSON-RPC daemon");
            Arc::new(RpcDaemon::new(RpcConfig {
                url: config.rpc_url.clone(),
                user: config.rpc_user.clone(),
                password: config.rpc_password.clone(),
                timeout: config.rpc_timeout,
            })?)
        }
        DaemonKind::Dummy => {
            warn!("Using in-process dummy daemon; blocks and payouts are not real");
            Arc::new(DummyDaemon::with_block_interval(1000))
        }
    };

    let store = match &config.state_file {
        Some(path) => {
            info!(path = %path.display(), "Loading state file");
            Arc::new(Store::open(path)?)
        }
        None => {
            warn!("No state file configured; pool state will not survive a restart");
            Arc::new(Store::in_memory())
        }
    };

    let coordinator = Coordinator::new(&config, daemon, store);
    let state = SharedState::new(
        coordinator.store.clone(),
        coordinator.work.clone(),
        coordinator.ledger.clone(),
    );
    let supervisor = coordinator.start();

    let mut server = tokio::spawn(api::serve(
        config.api_bind,
        state,
        supervisor.cancellation_token(),
    ));

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
        result = &mut server => {
            supervisor.shutdown().await;
            return result?;
        }
    }

    supervisor.shutdown().await;
    server.await??;

    Ok(())
}
