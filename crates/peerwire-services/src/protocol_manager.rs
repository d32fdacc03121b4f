//! Protocol manager — turns base handshakes into chain peers.
//!
//! The manager creates a [`Session`] per connection and listens to its
//! lifecycle. After the base handshake it negotiates capabilities and
//! attaches the chain handler; after the chain handshake it registers the
//! peer with sync and the tx pool; on disconnect it unregisters it again.
//!
//! Callbacks run on the calling session's task. Manager state lives in
//! sharded maps, so sessions never wait on each other.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;

use peerwire_core::capability::{CapabilityTable, ProtocolId};
use peerwire_core::chain::ChainFacts;
use peerwire_core::codec::PacketCodec;
use peerwire_core::wire::{short_id, Disconnect, DisconnectReason, NodeId, P2pMessage};

use crate::compat::CompatibilityValidator;
use crate::eth::EthHandler;
use crate::node_stats::{FailedCompatibilityValidation, HandshakeFacts, NodeStatsTracker};
use crate::pools::{ChainPeer, PooledTxSource, SyncPeerPool};
use crate::session::{
    next_session_id, ConnectionMeta, DisconnectOriginator, Session, SessionCommand,
    SessionConfig, SessionEnv, SessionError, SessionId, SessionInfo, SessionListener,
    SessionState, SharedSessionInfo, SubProtocolReady,
};
use crate::transport::PacketSender;

/// Static inputs of the manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub local_id: NodeId,
    pub client_id: String,
    pub listen_port: u16,
    pub keep_alive: Duration,
    pub max_peers: usize,
    pub capabilities: CapabilityTable,
    pub chain: ChainFacts,
}

struct TrackedSession {
    info: SharedSessionInfo,
    commands: mpsc::UnboundedSender<SessionCommand>,
}

struct ManagerInner {
    env: Arc<SessionEnv>,
    capabilities: CapabilityTable,
    chain: Arc<ChainFacts>,
    validator: CompatibilityValidator,
    stats: NodeStatsTracker,
    sync: Arc<dyn SyncPeerPool>,
    txpool: Arc<dyn PooledTxSource>,
    max_peers: usize,
    /// Peer slots in use; reserved before a session exists.
    admitted: AtomicUsize,
    sessions: DashMap<SessionId, TrackedSession>,
    active_nodes: DashMap<NodeId, SessionId>,
}

/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ProtocolManager {
    inner: Arc<ManagerInner>,
}

impl ProtocolManager {
    pub fn new(
        config: ManagerConfig,
        codec: Arc<dyn PacketCodec>,
        stats: NodeStatsTracker,
        sync: Arc<dyn SyncPeerPool>,
        txpool: Arc<dyn PooledTxSource>,
    ) -> Self {
        let env = Arc::new(SessionEnv {
            config: SessionConfig {
                local_id: config.local_id,
                client_id: config.client_id,
                listen_port: config.listen_port,
                capabilities: config.capabilities.advertised(),
                keep_alive: config.keep_alive,
            },
            codec,
            stats: stats.clone(),
        });

        Self {
            inner: Arc::new(ManagerInner {
                env,
                capabilities: config.capabilities,
                chain: Arc::new(config.chain),
                validator: CompatibilityValidator::new(stats.clone()),
                stats,
                sync,
                txpool,
                max_peers: config.max_peers,
                admitted: AtomicUsize::new(0),
                sessions: DashMap::new(),
                active_nodes: DashMap::new(),
            }),
        }
    }

    /// Create and start a session for a new transport connection.
    ///
    /// A node already connected, or a full peer table, is turned away with a
    /// Disconnect on the transport and no session is created.
    pub fn accept_connection(
        &self,
        meta: ConnectionMeta,
        sender: Arc<dyn PacketSender>,
    ) -> Result<Session, SessionError> {
        let inner = &self.inner;

        if !inner.reserve_slot() {
            self.reject(&meta, sender.as_ref(), DisconnectReason::TooManyPeers);
            return Err(SessionError::TooManyPeers);
        }

        let id = next_session_id();
        match inner.active_nodes.entry(meta.remote_id) {
            Entry::Occupied(_) => {
                inner.release_slot();
                self.reject(&meta, sender.as_ref(), DisconnectReason::AlreadyConnected);
                return Err(SessionError::AlreadyConnected);
            }
            Entry::Vacant(slot) => {
                slot.insert(id);
            }
        }

        let listener: Arc<dyn SessionListener> = Arc::clone(&self.inner) as Arc<dyn SessionListener>;
        let mut session = Session::new(id, meta, Arc::clone(&inner.env), listener);
        inner.sessions.insert(
            id,
            TrackedSession {
                info: session.info(),
                commands: session.commands(),
            },
        );

        session.init(sender)?;
        Ok(session)
    }

    fn reject(&self, meta: &ConnectionMeta, sender: &dyn PacketSender, reason: DisconnectReason) {
        tracing::info!(
            node = %short_id(&meta.remote_id),
            addr = %meta.remote_addr,
            reason = %reason,
            "connection rejected"
        );
        let msg = P2pMessage::Disconnect(Disconnect { reason });
        if let Ok(packet) = self.inner.env.codec.encode_p2p(&msg) {
            let _ = sender.send(packet);
        }
        sender.close();
    }

    /// Highest locally supported version of a protocol. Independent of peers.
    pub fn get_highest_protocol_version(&self, name: &str) -> Option<u32> {
        self.inner.capabilities.highest_version(name)
    }

    pub fn capabilities(&self) -> &CapabilityTable {
        &self.inner.capabilities
    }

    pub fn chain(&self) -> &ChainFacts {
        &self.inner.chain
    }

    pub fn stats(&self) -> &NodeStatsTracker {
        &self.inner.stats
    }

    /// Snapshot of tracked sessions, ordered by id.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut all: Vec<SessionInfo> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.value().info.read().clone())
            .collect();
        all.sort_by_key(|s| s.id);
        all
    }

    pub fn session(&self, id: SessionId) -> Option<SessionInfo> {
        self.inner
            .sessions
            .get(&id)
            .map(|entry| entry.value().info.read().clone())
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_connected(&self, node_id: &NodeId) -> bool {
        self.inner.active_nodes.contains_key(node_id)
    }

    /// Ask a session's driver to disconnect. False if the session is gone.
    pub fn disconnect(&self, id: SessionId, reason: DisconnectReason) -> bool {
        self.inner
            .sessions
            .get(&id)
            .map(|entry| entry.value().commands.send(SessionCommand::Disconnect(reason)).is_ok())
            .unwrap_or(false)
    }
}

impl ManagerInner {
    fn reserve_slot(&self) -> bool {
        self.admitted
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_peers).then_some(n + 1)
            })
            .is_ok()
    }

    fn release_slot(&self) {
        self.admitted.fetch_sub(1, Ordering::AcqRel);
    }

    fn attach_chain_handlers(&self, session: &mut Session) {
        let node_id = *session.remote_id();
        let shared = self.capabilities.negotiate(session.remote_capabilities());

        if !shared.iter().any(|c| c.protocol.is_chain()) {
            tracing::info!(
                session = session.id(),
                node = %short_id(&node_id),
                "no shared chain capability"
            );
            self.stats
                .record_incompatibility(&node_id, FailedCompatibilityValidation::MissingChainCapability);
            session.mark_disconnected(
                DisconnectReason::UselessPeer,
                DisconnectOriginator::Local,
                "no shared chain capability",
            );
            return;
        }

        for cap in shared {
            let handler = match cap.protocol {
                ProtocolId::Eth => Box::new(EthHandler::new(
                    cap.version,
                    Arc::clone(&self.chain),
                    self.validator.clone(),
                    Arc::clone(&self.sync),
                    Arc::clone(&self.txpool),
                )),
                ProtocolId::Other(ref name) => {
                    tracing::debug!(protocol = %name, "no handler for shared capability");
                    continue;
                }
            };

            tracing::debug!(
                session = session.id(),
                protocol = %cap.protocol,
                version = cap.version,
                offset = cap.offset,
                "capability negotiated"
            );
            if let Err(e) = session.attach_handler(handler, cap.offset) {
                session.mark_disconnected(
                    e.disconnect_reason(),
                    DisconnectOriginator::Local,
                    &e.to_string(),
                );
                return;
            }
        }
    }
}

impl SessionListener for ManagerInner {
    fn on_session_initialized(&self, session: &mut Session) {
        if session.state() != SessionState::Initialized {
            tracing::debug!(session = session.id(), state = ?session.state(), "late initialization ignored");
            return;
        }
        self.attach_chain_handlers(session);
    }

    fn on_sub_protocol_initialized(&self, session: &mut Session, ready: SubProtocolReady) {
        if session.state() != SessionState::Initialized {
            tracing::debug!(session = session.id(), state = ?session.state(), "late sub-protocol event ignored");
            return;
        }
        let Some(status) = ready.status else {
            return;
        };
        let node_id = *session.remote_id();

        self.stats.record_handshake(
            &node_id,
            HandshakeFacts {
                network_id: Some(status.network_id),
                chain_id: self.chain.chain_id,
                genesis_hash: Some(status.genesis_hash),
                best_hash: Some(status.best_hash),
                eth_version: Some(ready.version),
                total_difficulty: Some(status.total_difficulty.clone()),
                ..Default::default()
            },
        );
        self.stats.record_validated(&node_id);

        let peer = ChainPeer {
            node_id,
            client_id: session
                .remote_hello()
                .map(|h| h.client_id.clone())
                .unwrap_or_default(),
            eth_version: ready.version,
            total_difficulty: status.total_difficulty,
            best_hash: status.best_hash,
        };
        self.sync.add_peer(peer.clone());
        self.txpool.add_peer(peer);

        tracing::info!(
            session = session.id(),
            node = %short_id(&node_id),
            protocol = %ready.protocol,
            version = ready.version,
            "chain peer ready"
        );
    }

    fn on_session_disconnected(&self, session: &Session) {
        let id = session.id();
        if self.sessions.remove(&id).is_none() {
            return;
        }
        self.release_slot();
        let node_id = *session.remote_id();
        self.active_nodes.remove_if(&node_id, |_, owner| *owner == id);

        self.sync.remove_peer(&node_id);
        self.txpool.remove_peer(&node_id);

        tracing::debug!(
            session = id,
            node = %short_id(&node_id),
            remaining = self.sessions.len(),
            "session removed"
        );
    }
}
