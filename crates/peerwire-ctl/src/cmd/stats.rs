//! Node statistics commands.

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, get_json};

#[derive(Deserialize)]
struct StatsResponse {
    capacity: usize,
    nodes: Vec<NodeStatsEntry>,
}

#[derive(Deserialize)]
struct NodeStatsEntry {
    node_id: String,
    p2p_version: Option<u32>,
    client_id: Option<String>,
    network_id: Option<u64>,
    chain_id: Option<u64>,
    genesis_hash: Option<String>,
    best_hash: Option<String>,
    eth_version: Option<u32>,
    total_difficulty: Option<String>,
    failed_compatibility_validation: String,
    last_disconnect: Option<String>,
    handshakes: u64,
    validated_handshakes: u64,
    updated_at: u64,
}

fn opt<T: ToString>(v: &Option<T>) -> String {
    v.as_ref().map(|v| v.to_string()).unwrap_or_else(|| "-".into())
}

pub async fn cmd_stats(port: u16) -> Result<()> {
    let resp: StatsResponse = get_json(&format!("{}/stats", base_url(port))).await?;

    println!("{} / {} nodes tracked", resp.nodes.len(), resp.capacity);
    if resp.nodes.is_empty() {
        return Ok(());
    }
    println!();
    println!(
        "{:<18} {:<5} {:<8} {:<10} {:<14} {}",
        "NODE", "ETH", "NETWORK", "SHAKES", "FAILED", "CLIENT"
    );
    for n in &resp.nodes {
        println!(
            "{:<18} {:<5} {:<8} {:<10} {:<14} {}",
            &n.node_id[..n.node_id.len().min(16)],
            opt(&n.eth_version),
            opt(&n.network_id),
            format!("{}/{}", n.validated_handshakes, n.handshakes),
            n.failed_compatibility_validation,
            n.client_id.as_deref().unwrap_or("-"),
        );
    }

    Ok(())
}

pub async fn cmd_node_stats(port: u16, node_id: &str) -> Result<()> {
    let n: NodeStatsEntry = get_json(&format!("{}/stats/{}", base_url(port), node_id)).await?;

    println!("═══════════════════════════════════════");
    println!("  Node {}", &n.node_id[..n.node_id.len().min(16)]);
    println!("═══════════════════════════════════════");
    println!("  ID           : {}", n.node_id);
    println!("  Client       : {}", n.client_id.as_deref().unwrap_or("-"));
    println!("  p2p version  : {}", opt(&n.p2p_version));
    println!("  eth version  : {}", opt(&n.eth_version));
    println!("  Network      : {}", opt(&n.network_id));
    println!("  Chain        : {}", opt(&n.chain_id));
    println!("  Genesis      : {}", opt(&n.genesis_hash));
    println!("  Best hash    : {}", opt(&n.best_hash));
    println!("  Total diff.  : {}", opt(&n.total_difficulty));
    println!("  Failed check : {}", n.failed_compatibility_validation);
    println!("  Disconnect   : {}", opt(&n.last_disconnect));
    println!(
        "  Handshakes   : {} ({} validated)",
        n.handshakes, n.validated_handshakes
    );
    println!("  Updated at   : {}", n.updated_at);

    Ok(())
}
