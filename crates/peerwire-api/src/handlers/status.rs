//! /status, /capabilities, /daemon/shutdown handlers.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use peerwire_services::SessionState;

use super::ApiState;

// ── /status ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct StatusResponse {
    pub node_id: String,
    pub client_id: String,
    pub listen_port: u16,
    pub network_id: u64,
    pub head_number: u64,
    pub sessions: usize,
    pub initialized: usize,
    pub chain_peers: usize,
    pub tx_pool_peers: usize,
    pub known_nodes: usize,
}

pub async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let sessions = state.manager.sessions();
    let initialized = sessions
        .iter()
        .filter(|s| s.state == SessionState::Initialized)
        .count();
    let chain = state.manager.chain();

    Json(StatusResponse {
        node_id: hex::encode(state.node_id),
        client_id: state.client_id.clone(),
        listen_port: state.listen_port,
        network_id: chain.network_id,
        head_number: chain.head.number,
        sessions: sessions.len(),
        initialized,
        chain_peers: state.sync.len(),
        tx_pool_peers: state.txpool.len(),
        known_nodes: state.manager.stats().len(),
    })
}

// ── /capabilities ─────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct CapabilitiesResponse {
    pub protocols: Vec<ProtocolEntry>,
}

#[derive(Serialize)]
pub struct ProtocolEntry {
    pub name: String,
    pub versions: Vec<u32>,
    pub highest: Option<u32>,
    pub message_count: u8,
}

pub async fn handle_capabilities(State(state): State<ApiState>) -> Json<CapabilitiesResponse> {
    let protocols = state
        .manager
        .capabilities()
        .protocols()
        .iter()
        .map(|p| ProtocolEntry {
            name: p.id.to_string(),
            versions: p.versions.clone(),
            highest: p.highest(),
            message_count: p.message_count,
        })
        .collect();

    Json(CapabilitiesResponse { protocols })
}

// ── /daemon/shutdown ──────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ShutdownResponse {
    pub message: String,
}

pub async fn handle_shutdown(State(state): State<ApiState>) -> Json<ShutdownResponse> {
    tracing::info!("shutdown requested via API");
    let _ = state.shutdown_tx.send(());

    Json(ShutdownResponse {
        message: "Shutdown initiated".to_string(),
    })
}
