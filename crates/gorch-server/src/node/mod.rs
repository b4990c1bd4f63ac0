pub mod executor;
pub mod liveness;
pub mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use gorch_core::action::ActionTable;
use gorch_core::config::{HookSettings, NodeConfig};
use gorch_core::data::DataStore;
use gorch_core::resources::ResourceManager;
use gorch_hook::HookConfig;

use self::executor::ActionExecutor;
use self::liveness::{HttpLink, Registration};

/// Shared state of a node process.
#[derive(Clone)]
pub struct NodeState {
    pub config: Arc<NodeConfig>,
    pub executor: ActionExecutor,
    pub actions: Arc<RwLock<Arc<ActionTable>>>,
    pub data: Arc<RwLock<Arc<DataStore>>>,
    pub cancel: CancellationToken,
}

impl NodeState {
    /// Build the state and load the configured action table and data
    /// directory, if any.
    pub fn new(config: NodeConfig, cancel: CancellationToken) -> gorch_core::Result<Self> {
        let actions = match &config.actions_path {
            Some(path) => ActionTable::load(path)?,
            None => ActionTable::default(),
        };
        let data = match &config.data_dir {
            Some(dir) => DataStore::load(dir)?,
            None => DataStore::default(),
        };
        Ok(Self::with_tables(config, actions, data, cancel))
    }

    pub fn with_tables(
        config: NodeConfig,
        actions: ActionTable,
        data: DataStore,
        cancel: CancellationToken,
    ) -> Self {
        let resources = Arc::new(ResourceManager::new(config.resource_groups()));
        let executor = ActionExecutor::new(resources, hook_config(&config.hook), cancel.clone());
        Self {
            config: Arc::new(config),
            executor,
            actions: Arc::new(RwLock::new(Arc::new(actions))),
            data: Arc::new(RwLock::new(Arc::new(data))),
            cancel,
        }
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        self.executor.resources()
    }

    pub async fn actions(&self) -> Arc<ActionTable> {
        Arc::clone(&*self.actions.read().await)
    }

    pub async fn data(&self) -> Arc<DataStore> {
        Arc::clone(&*self.data.read().await)
    }

    /// Re-read the action table and data directory from disk. Each table is
    /// swapped only if it loaded cleanly.
    pub async fn reload(&self) -> gorch_core::Result<(usize, usize)> {
        let config = Arc::clone(&self.config);
        let (actions, data) = tokio::task::spawn_blocking(move || {
            let actions = config
                .actions_path
                .as_deref()
                .map(ActionTable::load)
                .transpose()?;
            let data = config.data_dir.as_deref().map(DataStore::load).transpose()?;
            Ok::<_, gorch_core::GorchError>((actions, data))
        })
        .await
        .map_err(|e| gorch_core::GorchError::Io(std::io::Error::other(e)))??;

        if let Some(actions) = actions {
            *self.actions.write().await = Arc::new(actions);
        }
        if let Some(data) = data {
            *self.data.write().await = Arc::new(data);
        }
        let counts = (self.actions().await.len(), self.data().await.files().len());
        info!(actions = counts.0, data_files = counts.1, "node tables reloaded");
        Ok(counts)
    }
}

pub fn hook_config(settings: &HookSettings) -> HookConfig {
    HookConfig {
        idle_timeout: std::time::Duration::from_millis(settings.idle_timeout_ms),
        request_timeout: std::time::Duration::from_millis(settings.request_timeout_ms),
        buffer: settings.buffer,
        shutdown_grace: std::time::Duration::from_millis(settings.shutdown_grace_ms),
    }
}

/// Build the node's axum Router.
pub fn build_router(state: NodeState) -> Router {
    Router::new()
        .route("/", get(routes::status))
        // Data
        .route("/data", get(routes::get_all_data))
        .route("/data/", get(routes::get_all_data))
        .route("/data/{file}", get(routes::get_data_file))
        .route("/list", get(routes::list_data))
        .route("/list/", get(routes::list_data))
        .route("/list/{file}", get(routes::list_data_file))
        // Actions
        .route(
            "/action",
            get(routes::list_actions).post(routes::run_adhoc_action),
        )
        .route(
            "/action/",
            get(routes::list_actions).post(routes::run_adhoc_action),
        )
        .route(
            "/action/{name}",
            get(routes::get_action).post(routes::run_action),
        )
        .route("/reload", axum::routing::post(routes::reload))
        .route("/reload/", axum::routing::post(routes::reload))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve `state` on a pre-bound listener and run the liveness task next to
/// it. Returns once `state.cancel` fires and the server, the liveness task and
/// every streamed action have stopped.
pub async fn serve_on(state: NodeState, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
    let local = listener.local_addr()?;
    let config = Arc::clone(&state.config);
    let cancel = state.cancel.clone();
    info!(node = %config.name, "gorch node listening on http://{local}");

    let liveness = config.orchestrator.clone().map(|orchestrator| {
        let link = HttpLink::new(
            &orchestrator,
            Registration {
                name: config.name.clone(),
                addr: config.host.clone(),
                port: local.port(),
            },
        );
        let liveness_config = config.liveness.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            liveness::run(&link, true, &liveness_config, token).await
        })
    });

    let executor = state.executor.clone();
    let app = build_router(state);
    let shutdown = cancel.clone();
    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await;

    // A server error still has to stop the heartbeat.
    cancel.cancel();
    if let Some(task) = liveness {
        let end = task.await?;
        info!(node = %config.name, state = %end, "liveness task stopped");
    }
    let streams = executor.streams_running();
    if streams > 0 {
        info!(node = %config.name, streams, "waiting for streamed actions");
    }
    executor.drain().await;
    served?;
    Ok(())
}

/// Bind the configured port and serve until cancelled.
pub async fn serve(config: NodeConfig, cancel: CancellationToken) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    let state = NodeState::new(config, cancel)?;
    serve_on(state, listener).await
}
