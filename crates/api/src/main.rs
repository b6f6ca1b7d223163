use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use forgefleet_api::config::ServerConfig;
use forgefleet_api::engine::{Engine, FsArtifactStore};
use forgefleet_api::router::build_app_router;
use forgefleet_api::state::AppState;
use forgefleet_api::ws;
use forgefleet_db::store::{JobStore, MemoryJobStore, PgJobStore};
use forgefleet_events::StatusBroadcaster;
use forgefleet_node::api::ForgeApi;
use forgefleet_node::catalog::NodeModelCatalog;
use forgefleet_node::client::NodeClient;
use forgefleet_node::registry::NodeRegistry;

/// How long in-flight engine tasks get to wind down after the server stops.
const ENGINE_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "forgefleet_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = ServerConfig::from_env().expect("Invalid configuration");
    tracing::info!(
        host = %config.host,
        port = %config.port,
        nodes = config.nodes.len(),
        "Loaded server configuration",
    );

    let store = open_store(config.database_url.as_deref()).await;
    let nodes = build_registry(&config);

    // --- Status stream ---
    let broadcaster = Arc::new(StatusBroadcaster::default());
    let ws_manager = Arc::new(ws::WsManager::new());
    let heartbeat_handle = ws::start_heartbeat(Arc::clone(&ws_manager));
    let forwarder_handle =
        ws::start_status_forwarder(broadcaster.subscribe_all(), Arc::clone(&ws_manager));

    // --- Engine ---
    let sink = Arc::new(FsArtifactStore::new(config.engine.output_dir.clone()));
    let engine = Engine::new(
        Arc::clone(&store),
        nodes,
        Arc::new(NodeModelCatalog),
        sink,
        Arc::clone(&broadcaster),
        config.engine.clone(),
    );
    engine.start().await;
    tracing::info!("Engine started");

    // --- App state ---
    let state = AppState {
        store,
        config: Arc::new(config.clone()),
        ws_manager: Arc::clone(&ws_manager),
        engine: Arc::clone(&engine),
        broadcaster: Arc::clone(&broadcaster),
    };

    let app = build_app_router(state, &config);

    // --- Start server ---
    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");

    // Monitors detach without touching job state; recovery resumes them.
    engine.shutdown(ENGINE_SHUTDOWN_TIMEOUT).await;
    tracing::info!("Engine stopped");

    forwarder_handle.abort();

    let ws_count = ws_manager.connection_count().await;
    tracing::info!(ws_count, "Closing remaining WebSocket connections");
    ws_manager.shutdown_all().await;

    heartbeat_handle.abort();

    tracing::info!("Graceful shutdown complete");
}

/// Postgres when a URL is configured (migrations applied), otherwise the
/// in-memory store.
async fn open_store(database_url: Option<&str>) -> Arc<dyn JobStore> {
    let Some(database_url) = database_url else {
        tracing::warn!("DATABASE_URL not set, using in-memory job store (jobs are lost on restart)");
        return Arc::new(MemoryJobStore::new());
    };

    let pool = forgefleet_db::create_pool(database_url)
        .await
        .expect("Failed to connect to database");
    forgefleet_db::health_check(&pool)
        .await
        .expect("Database health check failed");
    forgefleet_db::run_migrations(&pool)
        .await
        .expect("Failed to run database migrations");
    tracing::info!("Job store ready (postgres, migrations applied)");

    Arc::new(PgJobStore::new(pool))
}

fn build_registry(config: &ServerConfig) -> NodeRegistry {
    let timeout = Duration::from_secs(config.node_request_timeout_secs);
    let registry = NodeRegistry::new(config.nodes.iter().map(|node| {
        let api = ForgeApi::new(node.clone(), timeout).expect("Failed to build node HTTP client");
        tracing::info!(node_id = %node.id, api_url = %node.api_url, fn_index = node.fn_index, "Node configured");
        Arc::new(api) as Arc<dyn NodeClient>
    }));
    if registry.is_empty() {
        tracing::warn!("FORGE_NODES is empty, submitted jobs cannot be dispatched");
    }
    registry
}

/// Wait for SIGINT or (on Unix) SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
