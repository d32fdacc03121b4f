//! Sync and pooled-transaction registries.
//!
//! The session layer only registers and unregisters chain peers and forwards
//! their announcements. What sync and the tx pool do with them is their own
//! business; the in-memory registries here keep enough state for the daemon's
//! API and for tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use num_bigint::BigUint;

use peerwire_core::wire::{short_id, BlockHashNumber, Hash, NodeId};

/// A validated chain peer, as handed to sync and the tx pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainPeer {
    pub node_id: NodeId,
    pub client_id: String,
    pub eth_version: u32,
    pub total_difficulty: BigUint,
    pub best_hash: Hash,
}

/// Block synchronisation's view of peers.
pub trait SyncPeerPool: Send + Sync {
    fn add_peer(&self, peer: ChainPeer);

    fn remove_peer(&self, node_id: &NodeId);

    fn on_new_block_hashes(&self, node_id: &NodeId, hashes: &[BlockHashNumber]);
}

/// Transaction pool's view of peers.
pub trait PooledTxSource: Send + Sync {
    fn add_peer(&self, peer: ChainPeer);

    /// Unregister the peer and cancel its outstanding requests.
    fn remove_peer(&self, node_id: &NodeId);

    fn on_pooled_tx_hashes(&self, node_id: &NodeId, hashes: &[Hash]);
}

// ── Sync registry ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SyncPeer {
    pub peer: ChainPeer,
    /// Highest block number the peer announced since it joined.
    pub best_announced: Option<u64>,
    pub added_at: Instant,
}

/// In-memory [`SyncPeerPool`]. Clones share state.
#[derive(Clone, Default)]
pub struct SyncPeerRegistry {
    peers: Arc<DashMap<NodeId, SyncPeer>>,
    removals: Arc<AtomicU64>,
}

impl SyncPeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.peers.contains_key(node_id)
    }

    pub fn get(&self, node_id: &NodeId) -> Option<SyncPeer> {
        self.peers.get(node_id).map(|p| p.value().clone())
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Number of peers actually removed so far.
    pub fn removals(&self) -> u64 {
        self.removals.load(Ordering::Relaxed)
    }
}

impl SyncPeerPool for SyncPeerRegistry {
    fn add_peer(&self, peer: ChainPeer) {
        tracing::debug!(node = %short_id(&peer.node_id), version = peer.eth_version, "sync peer added");
        self.peers.insert(
            peer.node_id,
            SyncPeer {
                peer,
                best_announced: None,
                added_at: Instant::now(),
            },
        );
    }

    fn remove_peer(&self, node_id: &NodeId) {
        if self.peers.remove(node_id).is_some() {
            self.removals.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(node = %short_id(node_id), "sync peer removed");
        }
    }

    fn on_new_block_hashes(&self, node_id: &NodeId, hashes: &[BlockHashNumber]) {
        let Some(highest) = hashes.iter().map(|h| h.number).max() else {
            return;
        };
        if let Some(mut entry) = self.peers.get_mut(node_id) {
            let best = entry.best_announced.unwrap_or(0).max(highest);
            entry.best_announced = Some(best);
        }
    }
}

// ── Pooled transaction tracker ────────────────────────────────────────────────

/// Outstanding requests allowed against one peer.
pub const MAX_PENDING_PER_PEER: usize = 4096;

/// In-memory [`PooledTxSource`].
///
/// Announced hashes not yet requested from any peer become outstanding
/// requests against the announcing peer until the peer goes away. At most
/// [`MAX_PENDING_PER_PEER`] are held per peer; further announcements are
/// dropped.
#[derive(Clone)]
pub struct PooledTxTracker {
    peers: Arc<DashMap<NodeId, HashSet<Hash>>>,
    /// Requested hash → peer it is requested from.
    requested: Arc<DashMap<Hash, NodeId>>,
    max_pending: usize,
    removals: Arc<AtomicU64>,
    cancelled: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl Default for PooledTxTracker {
    fn default() -> Self {
        Self::with_limit(MAX_PENDING_PER_PEER)
    }
}

impl PooledTxTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(max_pending: usize) -> Self {
        Self {
            peers: Arc::new(DashMap::new()),
            requested: Arc::new(DashMap::new()),
            max_pending,
            removals: Arc::new(AtomicU64::new(0)),
            cancelled: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.peers.contains_key(node_id)
    }

    /// Outstanding requests against a peer.
    pub fn pending(&self, node_id: &NodeId) -> usize {
        self.peers.get(node_id).map(|p| p.len()).unwrap_or(0)
    }

    /// Outstanding requests across all peers.
    pub fn requested(&self) -> usize {
        self.requested.len()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn removals(&self) -> u64 {
        self.removals.load(Ordering::Relaxed)
    }

    /// Requests dropped because their peer left.
    pub fn cancelled(&self) -> u64 {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Announcements ignored because the peer was at its limit.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl PooledTxSource for PooledTxTracker {
    fn add_peer(&self, peer: ChainPeer) {
        self.peers.entry(peer.node_id).or_default();
        tracing::debug!(node = %short_id(&peer.node_id), "tx pool peer added");
    }

    fn remove_peer(&self, node_id: &NodeId) {
        if let Some((_, pending)) = self.peers.remove(node_id) {
            for hash in &pending {
                self.requested.remove_if(hash, |_, owner| owner == node_id);
            }
            self.removals.fetch_add(1, Ordering::Relaxed);
            self.cancelled
                .fetch_add(pending.len() as u64, Ordering::Relaxed);
            tracing::debug!(
                node = %short_id(node_id),
                cancelled = pending.len(),
                "tx pool peer removed"
            );
        }
    }

    fn on_pooled_tx_hashes(&self, node_id: &NodeId, hashes: &[Hash]) {
        let Some(mut pending) = self.peers.get_mut(node_id) else {
            return;
        };

        let mut dropped = 0usize;
        for hash in hashes {
            if pending.len() >= self.max_pending {
                dropped += 1;
                continue;
            }
            if let Entry::Vacant(slot) = self.requested.entry(*hash) {
                slot.insert(*node_id);
                pending.insert(*hash);
            }
        }

        if dropped > 0 {
            self.dropped.fetch_add(dropped as u64, Ordering::Relaxed);
            tracing::debug!(
                node = %short_id(node_id),
                dropped,
                pending = pending.len(),
                "tx announcements over limit"
            );
        }
    }
}
