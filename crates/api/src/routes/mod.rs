pub mod health;
pub mod jobs;
pub mod nodes;

use axum::routing::get;
use axum::Router;

use crate::state::AppState;
use crate::ws;

/// Build the `/api/v1` route tree.
///
/// ```text
/// /ws                      WebSocket status stream (?job_id=)
///
/// /jobs                    list, submit
/// /jobs/{id}               get
/// /jobs/{id}/cancel        cancel (POST)
/// /jobs/{id}/retry         retry (POST)
///
/// /nodes                   list
/// /nodes/{id}/models       node checkpoint catalog
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .nest("/jobs", jobs::router())
        .nest("/nodes", nodes::router())
}
