//! Handlers for the `/nodes` resource.

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use forgefleet_core::types::DbId;

use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;

/// A configured node and its lease.
#[derive(Debug, Serialize)]
pub struct NodeInfo {
    pub id: String,
    pub api_url: String,
    pub busy: bool,
    pub current_job_id: Option<DbId>,
}

/// GET /api/v1/nodes
pub async fn list_nodes(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let leases = state.engine.leases();
    let nodes: Vec<NodeInfo> = state
        .engine
        .nodes()
        .iter()
        .map(|node| {
            let current_job_id = leases.holder(node.node_id());
            NodeInfo {
                id: node.node_id().to_string(),
                api_url: node.base_url().to_string(),
                busy: current_job_id.is_some(),
                current_job_id,
            }
        })
        .collect();

    Ok(Json(DataResponse { data: nodes }))
}

/// GET /api/v1/nodes/{id}/models
///
/// Proxies the node's checkpoint catalog.
pub async fn list_node_models(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let node = state
        .engine
        .nodes()
        .get(&node_id)
        .ok_or_else(|| AppError::NotFound(format!("Node '{node_id}' is not configured")))?;

    let models = node
        .list_models()
        .await
        .map_err(|e| AppError::Upstream(format!("Node '{node_id}': {e}")))?;

    Ok(Json(DataResponse { data: models }))
}
