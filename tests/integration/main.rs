//! peerwire integration test harness.
//!
//! Two protocol managers are wired back to back over in-memory channels,
//! each session owned by its own driver task, exactly as the daemon runs
//! them over TCP. A relay task sits on each direction and counts pings.
//!
//!   cargo test --test integration

mod handshake;
mod lifecycle;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use num_bigint::BigUint;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use peerwire_core::wire::{p2p, BlockHashNumber, Packet};
use peerwire_core::{CapabilityTable, ChainFacts, ChainHead, Hash, JsonCodec, NodeId};
use peerwire_services::{
    ChainPeer, ChannelSender, ConnectionMeta, Direction, ManagerConfig, NodeStatsTracker,
    PooledTxSource, PooledTxTracker, ProtocolManager, Session, SessionDriver, SessionId,
    SyncPeerPool, SyncPeerRegistry,
};

pub const GENESIS: [u8; 32] = [0x11; 32];
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

// ── Harness ───────────────────────────────────────────────────────────────────

pub fn node_id(b: u8) -> NodeId {
    [b; 32]
}

pub fn chain(network_id: u64, total_difficulty: u64) -> ChainFacts {
    ChainFacts {
        network_id,
        chain_id: Some(network_id),
        genesis_hash: GENESIS,
        fork_blocks: vec![],
        head: ChainHead {
            number: 0,
            hash: GENESIS,
            total_difficulty: BigUint::from(total_difficulty),
        },
    }
}

/// One side of the wire: a manager and the pools it feeds.
pub struct Node {
    pub id: NodeId,
    pub manager: ProtocolManager,
    pub sync: SyncPeerRegistry,
    pub txpool: PooledTxTracker,
    sync_removes: Arc<AtomicUsize>,
    txpool_removes: Arc<AtomicUsize>,
}

impl Node {
    /// `remove_peer` calls the manager made on the sync pool, whether or
    /// not the peer was registered.
    pub fn sync_remove_calls(&self) -> usize {
        self.sync_removes.load(Ordering::Relaxed)
    }

    pub fn txpool_remove_calls(&self) -> usize {
        self.txpool_removes.load(Ordering::Relaxed)
    }
}

/// Forwards to the in-memory registry and counts `remove_peer` calls.
struct CountingSync {
    inner: SyncPeerRegistry,
    removes: Arc<AtomicUsize>,
}

impl SyncPeerPool for CountingSync {
    fn add_peer(&self, peer: ChainPeer) {
        self.inner.add_peer(peer);
    }

    fn remove_peer(&self, node_id: &NodeId) {
        self.removes.fetch_add(1, Ordering::Relaxed);
        self.inner.remove_peer(node_id);
    }

    fn on_new_block_hashes(&self, node_id: &NodeId, hashes: &[BlockHashNumber]) {
        self.inner.on_new_block_hashes(node_id, hashes);
    }
}

struct CountingTxPool {
    inner: PooledTxTracker,
    removes: Arc<AtomicUsize>,
}

impl PooledTxSource for CountingTxPool {
    fn add_peer(&self, peer: ChainPeer) {
        self.inner.add_peer(peer);
    }

    fn remove_peer(&self, node_id: &NodeId) {
        self.removes.fetch_add(1, Ordering::Relaxed);
        self.inner.remove_peer(node_id);
    }

    fn on_pooled_tx_hashes(&self, node_id: &NodeId, hashes: &[Hash]) {
        self.inner.on_pooled_tx_hashes(node_id, hashes);
    }
}

pub struct NodeBuilder {
    id: NodeId,
    capabilities: CapabilityTable,
    chain: ChainFacts,
    keep_alive: Duration,
    max_peers: usize,
}

impl NodeBuilder {
    pub fn new(b: u8) -> Self {
        Self {
            id: node_id(b),
            capabilities: CapabilityTable::default(),
            chain: chain(1, 1_000),
            keep_alive: Duration::from_secs(60),
            max_peers: 8,
        }
    }

    pub fn eth_versions(mut self, versions: &[u32]) -> Self {
        self.capabilities = CapabilityTable::eth(versions);
        self
    }

    pub fn chain(mut self, chain: ChainFacts) -> Self {
        self.chain = chain;
        self
    }

    pub fn keep_alive(mut self, period: Duration) -> Self {
        self.keep_alive = period;
        self
    }

    pub fn max_peers(mut self, max_peers: usize) -> Self {
        self.max_peers = max_peers;
        self
    }

    pub fn build(self) -> Node {
        let sync = SyncPeerRegistry::new();
        let txpool = PooledTxTracker::new();
        let sync_removes = Arc::new(AtomicUsize::new(0));
        let txpool_removes = Arc::new(AtomicUsize::new(0));
        let manager = ProtocolManager::new(
            ManagerConfig {
                local_id: self.id,
                client_id: format!("peerwire/test-{:02x}", self.id[0]),
                listen_port: 30303,
                keep_alive: self.keep_alive,
                max_peers: self.max_peers,
                capabilities: self.capabilities,
                chain: self.chain,
            },
            Arc::new(JsonCodec),
            NodeStatsTracker::default(),
            Arc::new(CountingSync {
                inner: sync.clone(),
                removes: Arc::clone(&sync_removes),
            }),
            Arc::new(CountingTxPool {
                inner: txpool.clone(),
                removes: Arc::clone(&txpool_removes),
            }),
        );
        Node {
            id: self.id,
            manager,
            sync,
            txpool,
            sync_removes,
            txpool_removes,
        }
    }
}

pub fn meta(remote_id: NodeId, direction: Direction) -> ConnectionMeta {
    ConnectionMeta {
        remote_id,
        remote_addr: "127.0.0.1:30303".parse().unwrap(),
        local_port: 30303,
        direction,
    }
}

/// Forward packets from one side's outbound channel to the other side's
/// driver, counting pings on the way. Ends when either side goes away.
fn relay(
    mut from: mpsc::Receiver<Packet>,
    to: mpsc::Sender<Packet>,
    pings: Arc<AtomicUsize>,
) {
    tokio::spawn(async move {
        while let Some(packet) = from.recv().await {
            if packet.code == p2p::PING {
                pings.fetch_add(1, Ordering::Relaxed);
            }
            if to.send(packet).await.is_err() {
                break;
            }
        }
    });
}

/// A running connection between two nodes.
pub struct Link {
    pub a_session: SessionId,
    pub b_session: SessionId,
    pub a_task: JoinHandle<Session>,
    pub b_task: JoinHandle<Session>,
    /// Pings sent by a / by b.
    pub a_pings: Arc<AtomicUsize>,
    pub b_pings: Arc<AtomicUsize>,
    pub shutdown: broadcast::Sender<()>,
}

impl Link {
    /// Wait for both drivers to finish and return both sessions.
    pub async fn finish(self) -> (Session, Session) {
        let a = tokio::time::timeout(HANDSHAKE_TIMEOUT, self.a_task)
            .await
            .expect("a driver did not finish")
            .expect("a driver panicked");
        let b = tokio::time::timeout(HANDSHAKE_TIMEOUT, self.b_task)
            .await
            .expect("b driver did not finish")
            .expect("b driver panicked");
        (a, b)
    }
}

/// Connect `a` (outbound) to `b` (inbound) and start both drivers.
pub fn connect(a: &Node, b: &Node) -> Link {
    let (a_sender, a_out) = ChannelSender::pair(256);
    let (b_sender, b_out) = ChannelSender::pair(256);

    let a_session = a
        .manager
        .accept_connection(meta(b.id, Direction::Outbound), Arc::new(a_sender))
        .expect("a accepts");
    let b_session = b
        .manager
        .accept_connection(meta(a.id, Direction::Inbound), Arc::new(b_sender))
        .expect("b accepts");

    let (to_a, a_in) = mpsc::channel(256);
    let (to_b, b_in) = mpsc::channel(256);
    let a_pings = Arc::new(AtomicUsize::new(0));
    let b_pings = Arc::new(AtomicUsize::new(0));
    relay(a_out, to_b, Arc::clone(&a_pings));
    relay(b_out, to_a, Arc::clone(&b_pings));

    let (shutdown, _) = broadcast::channel(1);
    let a_id = a_session.id();
    let b_id = b_session.id();
    let a_task = tokio::spawn(
        SessionDriver::new(a_session, a_in, HANDSHAKE_TIMEOUT, shutdown.subscribe()).run(),
    );
    let b_task = tokio::spawn(
        SessionDriver::new(b_session, b_in, HANDSHAKE_TIMEOUT, shutdown.subscribe()).run(),
    );

    Link {
        a_session: a_id,
        b_session: b_id,
        a_task,
        b_task,
        a_pings,
        b_pings,
        shutdown,
    }
}

/// Poll `cond` every 10ms until it holds or `within` elapses.
pub async fn wait_until(within: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Both sides registered each other as chain peers.
pub async fn wait_for_chain_peers(a: &Node, b: &Node) {
    let ready = wait_until(HANDSHAKE_TIMEOUT, || {
        a.sync.contains(&b.id) && b.sync.contains(&a.id)
    })
    .await;
    assert!(ready, "chain handshake did not complete");
}
