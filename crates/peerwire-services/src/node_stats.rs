//! Node stats — what we learned about each remote node, across sessions.
//!
//! Records outlive sessions so a reconnecting peer keeps its history. The
//! table is bounded: inserting a new identity at capacity evicts the record
//! that was updated least recently.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use num_bigint::BigUint;
use serde::Serialize;

use peerwire_core::wire::{short_id, DisconnectReason, Hash, NodeId};

/// Default number of node records kept.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Why the last handshake with a node was rejected, if it was.
///
/// Sticky: only a later fully validated handshake resets it to `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedCompatibilityValidation {
    #[default]
    None,
    NetworkId,
    GenesisHash,
    ProtocolVersion,
    ForkId,
    MissingChainCapability,
}

/// Facts a peer reported during a handshake. `None` fields leave the stored
/// value untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeFacts {
    pub p2p_version: Option<u32>,
    pub client_id: Option<String>,
    pub network_id: Option<u64>,
    pub chain_id: Option<u64>,
    pub genesis_hash: Option<Hash>,
    pub best_hash: Option<Hash>,
    pub eth_version: Option<u32>,
    pub total_difficulty: Option<BigUint>,
}

/// Per-node record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NodeStats {
    pub p2p_version: Option<u32>,
    pub client_id: Option<String>,
    pub network_id: Option<u64>,
    pub chain_id: Option<u64>,
    #[serde(serialize_with = "hex_opt")]
    pub genesis_hash: Option<Hash>,
    #[serde(serialize_with = "hex_opt")]
    pub best_hash: Option<Hash>,
    pub eth_version: Option<u32>,
    #[serde(serialize_with = "decimal_opt")]
    pub total_difficulty: Option<BigUint>,
    pub failed_compatibility_validation: FailedCompatibilityValidation,
    pub last_disconnect: Option<DisconnectReason>,
    /// Base handshakes started (Hellos received).
    pub handshakes: u64,
    pub validated_handshakes: u64,
    /// Seconds since the unix epoch.
    pub updated_at: u64,
    /// Update order, for eviction.
    #[serde(skip)]
    seq: u64,
}

fn hex_opt<S: serde::Serializer>(value: &Option<Hash>, s: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(h) => s.serialize_some(&hex::encode(h)),
        None => s.serialize_none(),
    }
}

fn decimal_opt<S: serde::Serializer>(value: &Option<BigUint>, s: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(td) => s.serialize_some(&td.to_str_radix(10)),
        None => s.serialize_none(),
    }
}

impl NodeStats {
    fn merge(&mut self, facts: HandshakeFacts) {
        if let Some(v) = facts.p2p_version {
            self.p2p_version = Some(v);
        }
        if let Some(v) = facts.client_id {
            self.client_id = Some(v);
        }
        if let Some(v) = facts.network_id {
            self.network_id = Some(v);
        }
        if let Some(v) = facts.chain_id {
            self.chain_id = Some(v);
        }
        if let Some(v) = facts.genesis_hash {
            self.genesis_hash = Some(v);
        }
        if let Some(v) = facts.best_hash {
            self.best_hash = Some(v);
        }
        if let Some(v) = facts.eth_version {
            self.eth_version = Some(v);
        }
        if let Some(v) = facts.total_difficulty {
            self.total_difficulty = Some(v);
        }
    }
}

/// Concurrent, bounded node stats table. Clones share state.
#[derive(Clone)]
pub struct NodeStatsTracker {
    records: Arc<DashMap<NodeId, NodeStats>>,
    capacity: usize,
    clock: Arc<AtomicU64>,
}

impl Default for NodeStatsTracker {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl NodeStatsTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
            clock: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Existing record, or a zero-valued one (which is then tracked).
    pub fn get_or_create(&self, node_id: &NodeId) -> NodeStats {
        self.update(node_id, |_| {})
    }

    /// Merge peer-reported facts, last write wins per field.
    pub fn record_handshake(&self, node_id: &NodeId, facts: HandshakeFacts) {
        self.update(node_id, |stats| stats.merge(facts));
    }

    /// A base handshake began: merge the Hello facts and count it.
    pub fn record_hello(&self, node_id: &NodeId, facts: HandshakeFacts) {
        self.update(node_id, |stats| {
            stats.merge(facts);
            stats.handshakes += 1;
        });
    }

    /// Record why the peer failed validation. Never cleared here.
    pub fn record_incompatibility(&self, node_id: &NodeId, reason: FailedCompatibilityValidation) {
        tracing::debug!(node = %short_id(node_id), reason = ?reason, "incompatibility recorded");
        self.update(node_id, |stats| {
            stats.failed_compatibility_validation = reason;
        });
    }

    /// The peer passed every check. The only place the failure reason resets.
    pub fn record_validated(&self, node_id: &NodeId) {
        self.update(node_id, |stats| {
            stats.failed_compatibility_validation = FailedCompatibilityValidation::None;
            stats.validated_handshakes += 1;
        });
    }

    pub fn record_disconnect(&self, node_id: &NodeId, reason: DisconnectReason) {
        self.update(node_id, |stats| {
            stats.last_disconnect = Some(reason);
        });
    }

    pub fn get(&self, node_id: &NodeId) -> Option<NodeStats> {
        self.records.get(node_id).map(|r| r.value().clone())
    }

    /// All records, most recently updated first.
    pub fn snapshot(&self) -> Vec<(NodeId, NodeStats)> {
        let mut all: Vec<(NodeId, NodeStats)> = self
            .records
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        all.sort_by(|a, b| b.1.seq.cmp(&a.1.seq));
        all
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn update(&self, node_id: &NodeId, f: impl FnOnce(&mut NodeStats)) -> NodeStats {
        if !self.records.contains_key(node_id) && self.records.len() >= self.capacity {
            self.evict_oldest();
        }

        let seq = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        let mut entry = self.records.entry(*node_id).or_default();
        f(entry.value_mut());
        entry.seq = seq;
        entry.updated_at = unix_now();
        entry.value().clone()
    }

    fn evict_oldest(&self) {
        let oldest = self
            .records
            .iter()
            .min_by_key(|entry| entry.value().seq)
            .map(|entry| *entry.key());
        if let Some(node_id) = oldest {
            self.records.remove(&node_id);
            tracing::trace!(node = %short_id(&node_id), "node stats evicted");
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
