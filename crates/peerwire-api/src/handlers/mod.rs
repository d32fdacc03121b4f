//! HTTP API handlers — exposes session and node state as JSON.

pub mod sessions;
pub mod stats;
pub mod status;

use axum::http::StatusCode;

use peerwire_core::wire::NodeId;
use peerwire_services::{PooledTxTracker, ProtocolManager, SessionId, SyncPeerRegistry};

#[derive(Clone)]
pub struct ApiState {
    pub manager: ProtocolManager,
    pub sync: SyncPeerRegistry,
    pub txpool: PooledTxTracker,
    pub node_id: NodeId,
    pub client_id: String,
    pub listen_port: u16,
    /// Shutdown broadcast sender — signals graceful daemon shutdown.
    pub shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

// ── Shared helpers ────────────────────────────────────────────────────────────

/// Parse a hex-encoded 32-byte node id.
fn parse_node_id(hex_str: &str) -> Result<NodeId, (StatusCode, String)> {
    let bytes =
        hex::decode(hex_str).map_err(|_| (StatusCode::BAD_REQUEST, "invalid hex".to_string()))?;
    if bytes.len() != 32 {
        return Err((
            StatusCode::BAD_REQUEST,
            "node id must be 32 bytes".to_string(),
        ));
    }
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&bytes);
    Ok(arr)
}

fn parse_session_id(s: &str) -> Result<SessionId, (StatusCode, String)> {
    s.parse()
        .map_err(|_| (StatusCode::BAD_REQUEST, "invalid session id".to_string()))
}

// Re-export handler functions for use in router setup.
pub use sessions::{handle_session_drop, handle_session_inspect, handle_sessions};
pub use stats::{handle_node_stats, handle_stats};
pub use status::{handle_capabilities, handle_shutdown, handle_status};
