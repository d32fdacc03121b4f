//! peerwired — peer session daemon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use peerwire_core::codec::JsonCodec;
use peerwire_core::config::PeerwireConfig;
use peerwire_core::wire::short_id;
use peerwire_services::{
    ManagerConfig, NodeStatsTracker, PooledTxTracker, ProtocolManager, SessionState,
    SyncPeerRegistry,
};

mod net;

use net::dialer::Dialer;
use net::listener::TcpAcceptor;
use net::ConnectionContext;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = PeerwireConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = PeerwireConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        PeerwireConfig::default()
    });

    let node_id = config
        .identity
        .load_or_generate()
        .context("failed to load node id")?;
    let chain = config.chain.facts().context("invalid chain config")?;
    let capabilities = config.protocol.capability_table();
    tracing::info!(
        node = %short_id(&node_id),
        network_id = chain.network_id,
        head = chain.head.number,
        eth = ?capabilities.highest_version("eth"),
        "peerwired starting"
    );

    // Shared state
    let stats = NodeStatsTracker::new(config.protocol.node_stats_capacity);
    let sync = SyncPeerRegistry::new();
    let txpool = PooledTxTracker::new();
    let manager = ProtocolManager::new(
        ManagerConfig {
            local_id: node_id,
            client_id: config.protocol.client_id.clone(),
            listen_port: config.network.listen_port,
            keep_alive: config.protocol.keep_alive(),
            max_peers: config.network.max_peers,
            capabilities,
            chain,
        },
        Arc::new(JsonCodec),
        stats,
        Arc::new(sync.clone()),
        Arc::new(txpool.clone()),
    );

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let ctx = ConnectionContext {
        manager: manager.clone(),
        local_id: node_id,
        handshake_timeout: config.protocol.handshake_timeout(),
        shutdown_tx: shutdown_tx.clone(),
    };

    let tcp_listener = TcpListener::bind(("0.0.0.0", config.network.listen_port))
        .await
        .with_context(|| format!("failed to bind port {}", config.network.listen_port))?;
    tracing::info!(port = config.network.listen_port, "listening for peers");

    let acceptor_task = tokio::spawn(TcpAcceptor::new(tcp_listener, ctx.clone()).run());
    let dialer_task = tokio::spawn(Dialer::new(config.network.bootnodes.clone(), ctx).run());

    let session_printer = {
        let manager = manager.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                let sessions = manager.sessions();
                tracing::info!(
                    count = sessions.len(),
                    known_nodes = manager.stats().len(),
                    "session table snapshot"
                );
                for s in sessions.iter().filter(|s| s.state == SessionState::Initialized) {
                    tracing::info!(
                        session = s.id,
                        peer = %s.remote_addr,
                        client = s.client_id.as_deref().unwrap_or("?"),
                        protocols = ?s.protocols,
                        "  session"
                    );
                }
            }
        })
    };

    // Status HTTP endpoint
    let api_port = config.network.api_port;
    let api_task = {
        let state = peerwire_api::ApiState {
            manager: manager.clone(),
            sync,
            txpool,
            node_id,
            client_id: config.protocol.client_id.clone(),
            listen_port: config.network.listen_port,
            shutdown_tx: shutdown_tx.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = peerwire_api::serve(state, api_port).await {
                tracing::error!(error = %e, "api server failed");
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv()  => tracing::info!("shutting down"),
        r = acceptor_task       => tracing::error!("tcp acceptor exited: {:?}", r),
        r = dialer_task         => tracing::error!("dialer exited: {:?}", r),
        r = session_printer     => tracing::error!("session printer exited: {:?}", r),
        r = api_task            => tracing::error!("api server exited: {:?}", r),
    }

    // Sessions see the same broadcast; give their drivers a moment to send Disconnect.
    let _ = shutdown_tx.send(());
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while manager.session_count() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    Ok(())
}
