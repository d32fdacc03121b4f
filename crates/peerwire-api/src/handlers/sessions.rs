//! /sessions handlers — session inspection and management.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use peerwire_core::wire::DisconnectReason;
use peerwire_services::SessionInfo;

use super::{parse_session_id, ApiState};

// ── /sessions ─────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionInfo>,
}

pub async fn handle_sessions(State(state): State<ApiState>) -> Json<SessionsResponse> {
    Json(SessionsResponse {
        sessions: state.manager.sessions(),
    })
}

// ── /sessions/:id (GET) ───────────────────────────────────────────────────────

pub async fn handle_session_inspect(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionInfo>, (StatusCode, String)> {
    let id = parse_session_id(&session_id)?;
    state
        .manager
        .session(id)
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, "session not found".to_string()))
}

// ── /sessions/:id (DELETE) ────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct SessionDropResponse {
    pub session_id: u64,
    pub dropped: bool,
}

pub async fn handle_session_drop(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionDropResponse>, (StatusCode, String)> {
    let id = parse_session_id(&session_id)?;
    let dropped = state
        .manager
        .disconnect(id, DisconnectReason::DisconnectRequested);

    if dropped {
        tracing::info!(session = id, "session dropped via API");
    }

    Ok(Json(SessionDropResponse {
        session_id: id,
        dropped,
    }))
}
