use axum::routing::get;
use axum::Router;

use crate::handlers::nodes;
use crate::state::AppState;

/// Routes mounted at `/nodes`.
///
/// ```text
/// GET    /                -> list_nodes
/// GET    /{id}/models     -> list_node_models
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(nodes::list_nodes))
        .route("/{id}/models", get(nodes::list_node_models))
}
