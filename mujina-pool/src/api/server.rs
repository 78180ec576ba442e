use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_axum::router::OpenApiRouter;
use utoipa_swagger_ui::SwaggerUi;

use super::v0;
use crate::ledger::ShareLedger;
use crate::store::Store;
use crate::tracing::prelude::*;
use crate::work::WorkCache;

/// State shared by all handlers.
#[derive(Clone)]
pub struct SharedState {
    pub store: Arc<Store>,
    pub work: Arc<WorkCache>,
    pub ledger: Arc<ShareLedger>,
    started: Instant,
}

impl SharedState {
    pub fn new(store: Arc<Store>, work: Arc<WorkCache>, ledger: Arc<ShareLedger>) -> Self {
        Self {
            store,
            work,
            ledger,
            started: Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

#[derive(OpenApi)]
#[openapi(
    info(title = "mujina-pool", description = "Mining pool coordinator API"),
    tags(
        (name = "health"),
        (name = "work", description = "Work protocol for miners"),
        (name = "workers"),
        (name = "blocks"),
        (name = "pool"),
    ),
)]
struct ApiDoc;

/// Build the application router.
pub fn router(state: SharedState) -> Router {
    let (routes, api) = OpenApiRouter::with_openapi(ApiDoc::openapi())
        .nest("/api/v0", v0::routes())
        .split_for_parts();

    routes
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", api))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API on `bind` until `shutdown` is cancelled.
pub async fn serve(bind: SocketAddr, state: SharedState, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind API listener on {bind}"))?;
    info!(%bind, "API server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server failed")?;

    debug!("API server stopped");
    Ok(())
}
