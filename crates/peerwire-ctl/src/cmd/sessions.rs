//! Session listing and management commands.

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, delete_json, get_json};

#[derive(Deserialize)]
struct SessionsResponse {
    sessions: Vec<SessionInfo>,
}

#[derive(Deserialize)]
struct SessionInfo {
    id: u64,
    remote_id: String,
    remote_addr: String,
    local_port: u16,
    direction: String,
    state: String,
    p2p_version: Option<u32>,
    client_id: Option<String>,
    capabilities: Vec<String>,
    protocols: Vec<String>,
    ready: bool,
    disconnect_reason: Option<String>,
    uptime_secs: u64,
}

#[derive(Deserialize)]
struct DropResponse {
    session_id: u64,
    dropped: bool,
}

fn short(hex: &str) -> &str {
    &hex[..hex.len().min(16)]
}

pub async fn cmd_sessions(port: u16) -> Result<()> {
    let resp: SessionsResponse = get_json(&format!("{}/sessions", base_url(port))).await?;

    if resp.sessions.is_empty() {
        println!("No active sessions.");
        return Ok(());
    }

    println!(
        "{:<6} {:<18} {:<22} {:<9} {:<12} {:<6} {}",
        "ID", "NODE", "ADDRESS", "DIR", "STATE", "READY", "CLIENT"
    );
    for s in &resp.sessions {
        println!(
            "{:<6} {:<18} {:<22} {:<9} {:<12} {:<6} {}",
            s.id,
            short(&s.remote_id),
            s.remote_addr,
            s.direction,
            s.state,
            if s.ready { "yes" } else { "no" },
            s.client_id.as_deref().unwrap_or("-"),
        );
    }

    Ok(())
}

pub async fn cmd_session_inspect(port: u16, session_id: &str) -> Result<()> {
    let s: SessionInfo =
        get_json(&format!("{}/sessions/{}", base_url(port), session_id)).await?;

    println!("═══════════════════════════════════════");
    println!("  Session {}", s.id);
    println!("═══════════════════════════════════════");
    println!("  Node         : {}", s.remote_id);
    println!("  Address      : {}", s.remote_addr);
    println!("  Local port   : {}", s.local_port);
    println!("  Direction    : {}", s.direction);
    println!("  State        : {}", s.state);
    println!(
        "  p2p version  : {}",
        s.p2p_version.map(|v| v.to_string()).unwrap_or_else(|| "-".into())
    );
    println!("  Client       : {}", s.client_id.as_deref().unwrap_or("-"));
    println!("  Capabilities : {}", s.capabilities.join(", "));
    println!("  Protocols    : {}", s.protocols.join(", "));
    println!("  Ready        : {}", s.ready);
    if let Some(reason) = &s.disconnect_reason {
        println!("  Disconnect   : {}", reason);
    }
    println!("  Uptime       : {}s", s.uptime_secs);

    Ok(())
}

pub async fn cmd_session_drop(port: u16, session_id: &str) -> Result<()> {
    let resp: DropResponse =
        delete_json(&format!("{}/sessions/{}", base_url(port), session_id)).await?;

    if resp.dropped {
        println!("✓ Session {} disconnecting", resp.session_id);
    } else {
        println!("Session not found: {}", session_id);
    }

    Ok(())
}
