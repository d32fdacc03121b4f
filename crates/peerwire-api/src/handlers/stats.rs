//! /stats handlers — per-node handshake history.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use peerwire_services::NodeStats;

use super::{parse_node_id, ApiState};

#[derive(Serialize)]
pub struct NodeStatsEntry {
    pub node_id: String,
    #[serde(flatten)]
    pub stats: NodeStats,
}

#[derive(Serialize)]
pub struct StatsResponse {
    pub capacity: usize,
    pub nodes: Vec<NodeStatsEntry>,
}

pub async fn handle_stats(State(state): State<ApiState>) -> Json<StatsResponse> {
    let tracker = state.manager.stats();
    let nodes = tracker
        .snapshot()
        .into_iter()
        .map(|(id, stats)| NodeStatsEntry {
            node_id: hex::encode(id),
            stats,
        })
        .collect();

    Json(StatsResponse {
        capacity: tracker.capacity(),
        nodes,
    })
}

pub async fn handle_node_stats(
    State(state): State<ApiState>,
    Path(node_id): Path<String>,
) -> Result<Json<NodeStatsEntry>, (StatusCode, String)> {
    let id = parse_node_id(&node_id)?;
    let stats = state
        .manager
        .stats()
        .get(&id)
        .ok_or((StatusCode::NOT_FOUND, "node not known".to_string()))?;

    Ok(Json(NodeStatsEntry {
        node_id: hex::encode(id),
        stats,
    }))
}
