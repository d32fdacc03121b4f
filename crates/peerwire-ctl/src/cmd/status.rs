//! Daemon status, capabilities and shutdown commands.

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, get_json, post_json};

#[derive(Deserialize)]
struct StatusResponse {
    node_id: String,
    client_id: String,
    listen_port: u16,
    network_id: u64,
    head_number: u64,
    sessions: usize,
    initialized: usize,
    chain_peers: usize,
    tx_pool_peers: usize,
    known_nodes: usize,
}

#[derive(Deserialize)]
struct CapabilitiesResponse {
    protocols: Vec<ProtocolEntry>,
}

#[derive(Deserialize)]
struct ProtocolEntry {
    name: String,
    versions: Vec<u32>,
    highest: Option<u32>,
    message_count: u8,
}

#[derive(Deserialize)]
struct ShutdownResponse {
    message: String,
}

pub async fn cmd_status(port: u16) -> Result<()> {
    let s: StatusResponse = get_json(&format!("{}/status", base_url(port))).await?;

    println!("═══════════════════════════════════════");
    println!("  peerwired");
    println!("═══════════════════════════════════════");
    println!("  Node      : {}", s.node_id);
    println!("  Client    : {}", s.client_id);
    println!("  Listen    : {}", s.listen_port);
    println!("  Network   : {}", s.network_id);
    println!("  Head      : #{}", s.head_number);
    println!();
    println!("  Sessions  : {} ({} initialized)", s.sessions, s.initialized);
    println!("  Sync      : {} peers", s.chain_peers);
    println!("  Tx pool   : {} peers", s.tx_pool_peers);
    println!("  Known     : {} nodes", s.known_nodes);

    Ok(())
}

pub async fn cmd_capabilities(port: u16) -> Result<()> {
    let resp: CapabilitiesResponse =
        get_json(&format!("{}/capabilities", base_url(port))).await?;

    if resp.protocols.is_empty() {
        println!("No sub-protocols registered.");
        return Ok(());
    }

    println!("{:<8} {:<16} {:<8} {}", "NAME", "VERSIONS", "HIGHEST", "MESSAGES");
    for p in resp.protocols {
        let versions = p
            .versions
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let highest = p.highest.map(|v| v.to_string()).unwrap_or_else(|| "-".into());
        println!(
            "{:<8} {:<16} {:<8} {}",
            p.name, versions, highest, p.message_count
        );
    }

    Ok(())
}

pub async fn cmd_shutdown(port: u16) -> Result<()> {
    let resp: ShutdownResponse =
        post_json(&format!("{}/daemon/shutdown", base_url(port))).await?;
    println!("{}", resp.message);
    Ok(())
}
