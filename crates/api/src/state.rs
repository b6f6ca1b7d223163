use std::sync::Arc;

use forgefleet_db::store::JobStore;
use forgefleet_events::StatusBroadcaster;

use crate::config::ServerConfig;
use crate::engine::Engine;
use crate::ws::WsManager;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// This is cheaply cloneable (inner data is behind `Arc`).
#[derive(Clone)]
pub struct AppState {
    /// Job persistence (Postgres, or in-memory for development).
    pub store: Arc<dyn JobStore>,
    pub config: Arc<ServerConfig>,
    /// WebSocket connection manager (status stream clients).
    pub ws_manager: Arc<WsManager>,
    /// Dispatcher, monitors and node leases.
    pub engine: Arc<Engine>,
    pub broadcaster: Arc<StatusBroadcaster>,
}
