pub mod registry;
pub mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use gorch_core::config::OrchestratorConfig;

use self::registry::Registry;

/// Shared state of an orchestrator process.
#[derive(Clone)]
pub struct OrchestratorState {
    pub config: Arc<OrchestratorConfig>,
    pub registry: Arc<Registry>,
    pub http: reqwest::Client,
    pub cancel: CancellationToken,
}

impl OrchestratorState {
    pub fn new(config: OrchestratorConfig, cancel: CancellationToken) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::new(Registry::new()),
            http: reqwest::Client::new(),
            cancel,
        }
    }
}

/// Build the orchestrator's axum Router.
pub fn build_router(state: OrchestratorState) -> Router {
    Router::new()
        .route("/", get(routes::status))
        .route("/register", post(routes::register))
        .route("/register/", post(routes::register))
        .route("/ping/{name}", post(routes::ping))
        .route("/disconnect/{name}", post(routes::disconnect))
        .route("/nodes", get(routes::list_nodes))
        .route(
            "/{node}/{*rest}",
            get(routes::dispatch).post(routes::dispatch),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Evict stale nodes every sweep period until `cancel` fires.
pub async fn sweep_loop(
    registry: Arc<Registry>,
    config: Arc<OrchestratorConfig>,
    cancel: CancellationToken,
) {
    let period = config.sweep_period();
    let stale_after =
        chrono::Duration::milliseconds(i64::try_from(config.stale_after_ms).unwrap_or(i64::MAX));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let evicted = registry.sweep_at(chrono::Utc::now(), stale_after);
                debug!(evicted = evicted.len(), num_nodes = registry.len(), "eviction sweep");
            }
        }
    }
}

/// Serve on a pre-bound listener with the eviction sweep running alongside.
/// Returns once `state.cancel` fires and both have stopped.
pub async fn serve_on(
    state: OrchestratorState,
    listener: tokio::net::TcpListener,
) -> anyhow::Result<()> {
    let local = listener.local_addr()?;
    info!("gorch orchestrator listening on http://{local}");

    let cancel = state.cancel.clone();
    let sweeper = tokio::spawn(sweep_loop(
        Arc::clone(&state.registry),
        Arc::clone(&state.config),
        cancel.clone(),
    ));

    let app = build_router(state);
    let shutdown = cancel.clone();
    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await;

    cancel.cancel();
    sweeper.await?;
    info!("gorch orchestrator stopped");
    served?;
    Ok(())
}

/// Bind the configured port and serve until cancelled.
pub async fn serve(config: OrchestratorConfig, cancel: CancellationToken) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    serve_on(OrchestratorState::new(config, cancel), listener).await
}
