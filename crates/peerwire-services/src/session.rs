//! Peer session — one connection's lifecycle and message routing.
//!
//! ```text
//! New ──init──▶ Handshaking ──peer Hello──▶ Initialized
//!  │                 │                          │
//!  └─────────────────┴──────────┬───────────────┘
//!                               ▼
//!                 Disconnecting ──▶ Disconnected
//! ```
//!
//! The session speaks the base protocol (Hello, Disconnect, Ping, Pong)
//! itself and routes every higher message code to the sub-protocol handler
//! whose offset range contains it. Lifecycle events go to a
//! [`SessionListener`]; the session never decides which sub-protocols to run.
//!
//! A session is driven by exactly one task, so all of its methods take
//! `&mut self` and run sequentially.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use peerwire_core::capability::{Capability, ProtocolId};
use peerwire_core::codec::PacketCodec;
use peerwire_core::wire::{
    short_id, Disconnect, DisconnectReason, EthMessage, Hello, NodeId, P2pMessage, Packet,
    Status, WireError, BASE_PROTOCOL_LENGTH, MIN_P2P_VERSION, P2P_VERSION,
};

use crate::keepalive;
use crate::node_stats::{FailedCompatibilityValidation, HandshakeFacts, NodeStatsTracker};
use crate::transport::{OutboundGate, PacketSender, TransportError};

/// Process-unique session identifier.
pub type SessionId = u64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_session_id() -> SessionId {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    New,
    Handshaking,
    Initialized,
    Disconnecting,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Which side ended the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectOriginator {
    Local,
    Remote,
}

/// What the transport knows about a new connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionMeta {
    /// Identity authenticated by the transport.
    pub remote_id: NodeId,
    pub remote_addr: SocketAddr,
    pub local_port: u16,
    pub direction: Direction,
}

/// Local node facts every session announces.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub local_id: NodeId,
    pub client_id: String,
    pub listen_port: u16,
    pub capabilities: Vec<Capability>,
    pub keep_alive: Duration,
}

/// Shared, read-only inputs of every session.
pub struct SessionEnv {
    pub config: SessionConfig,
    pub codec: Arc<dyn PacketCodec>,
    pub stats: NodeStatsTracker,
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("wire: {0}")]
    Wire(#[from] WireError),

    #[error("protocol breach: {0}")]
    Breach(String),

    #[error("handler for {0} already attached")]
    HandlerAlreadyAttached(ProtocolId),

    #[error("invalid session state: {0:?}")]
    InvalidState(SessionState),

    #[error("node already connected")]
    AlreadyConnected,

    #[error("too many peers")]
    TooManyPeers,
}

impl SessionError {
    /// Disconnect reason for an error that ends the session.
    pub fn disconnect_reason(&self) -> DisconnectReason {
        match self {
            SessionError::Transport(_) => DisconnectReason::TcpSubsystemError,
            SessionError::AlreadyConnected => DisconnectReason::AlreadyConnected,
            SessionError::TooManyPeers => DisconnectReason::TooManyPeers,
            _ => DisconnectReason::BreachOfProtocol,
        }
    }
}

// ── Sub-protocol handlers ─────────────────────────────────────────────────────

/// What a handler sees of its session.
pub struct HandlerContext<'a> {
    pub node_id: NodeId,
    /// First absolute message code of the handler's range.
    pub offset: u8,
    outbound: &'a OutboundGate,
    codec: &'a dyn PacketCodec,
}

impl<'a> HandlerContext<'a> {
    pub fn send_eth(&self, msg: &EthMessage) -> Result<(), SessionError> {
        let packet = self.codec.encode_eth(msg, self.offset)?;
        self.outbound.send(packet)?;
        Ok(())
    }

    pub fn decode_eth(&self, code: u8, data: Bytes) -> Result<EthMessage, SessionError> {
        Ok(self.codec.decode_eth(&Packet::new(code, data), self.offset)?)
    }
}

/// A sub-protocol handshake completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubProtocolReady {
    pub protocol: ProtocolId,
    pub version: u32,
    /// The peer's validated Status, for chain protocols.
    pub status: Option<Status>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerEvent {
    None,
    Initialized(SubProtocolReady),
    Disconnect {
        reason: DisconnectReason,
        details: String,
    },
}

/// A sub-protocol running on a session.
///
/// `receive_message` gets the absolute message code. Returning `Err` ends the
/// session with [`SessionError::disconnect_reason`].
pub trait SubProtocolHandler: Send {
    fn protocol(&self) -> ProtocolId;

    fn version(&self) -> u32;

    fn message_count(&self) -> u8;

    fn init(&mut self, ctx: &HandlerContext<'_>) -> Result<(), SessionError>;

    fn receive_message(
        &mut self,
        ctx: &HandlerContext<'_>,
        code: u8,
        data: Bytes,
    ) -> Result<HandlerEvent, SessionError>;

    fn on_detach(&mut self);
}

struct AttachedHandler {
    handler: Box<dyn SubProtocolHandler>,
    offset: u8,
    message_count: u8,
    initialized: bool,
}

impl AttachedHandler {
    fn contains(&self, code: u8) -> bool {
        code >= self.offset && code - self.offset < self.message_count
    }
}

/// Receives session lifecycle events. Callbacks run on the session's task.
pub trait SessionListener: Send + Sync {
    /// Base handshake done; the session is `Initialized`.
    fn on_session_initialized(&self, session: &mut Session);

    fn on_sub_protocol_initialized(&self, session: &mut Session, ready: SubProtocolReady);

    /// Called exactly once per session.
    fn on_session_disconnected(&self, session: &Session);
}

/// Control messages delivered to the session's driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    Disconnect(DisconnectReason),
}

// ── Published state ───────────────────────────────────────────────────────────

/// Live view of a session, readable from other tasks.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub remote_id: String,
    pub remote_addr: SocketAddr,
    pub local_port: u16,
    pub direction: Direction,
    pub state: SessionState,
    pub p2p_version: Option<u32>,
    pub client_id: Option<String>,
    /// Capabilities the peer advertised.
    pub capabilities: Vec<String>,
    /// Attached sub-protocols, e.g. "eth/68".
    pub protocols: Vec<String>,
    /// Every attached sub-protocol completed its handshake.
    pub ready: bool,
    pub disconnect_reason: Option<DisconnectReason>,
    pub uptime_secs: u64,
}

pub type SharedSessionInfo = Arc<RwLock<SessionInfo>>;

// ── Session ───────────────────────────────────────────────────────────────────

pub struct Session {
    id: SessionId,
    meta: ConnectionMeta,
    state: SessionState,
    env: Arc<SessionEnv>,
    listener: Arc<dyn SessionListener>,
    outbound: Arc<OutboundGate>,
    handlers: BTreeMap<ProtocolId, AttachedHandler>,
    remote_hello: Option<Hello>,
    /// Set as soon as a Hello is processed, accepted or not.
    hello_received: bool,
    p2p_version: Option<u32>,
    keep_alive: Option<JoinHandle<()>>,
    disconnect_reason: Option<DisconnectReason>,
    established_at: Instant,
    info: SharedSessionInfo,
    command_tx: mpsc::UnboundedSender<SessionCommand>,
    command_rx: Option<mpsc::UnboundedReceiver<SessionCommand>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("remote", &short_id(&self.meta.remote_id))
            .field("state", &self.state)
            .field("protocols", &self.handlers.keys().collect::<Vec<_>>())
            .field("disconnect_reason", &self.disconnect_reason)
            .finish()
    }
}

impl Session {
    pub fn new(
        id: SessionId,
        meta: ConnectionMeta,
        env: Arc<SessionEnv>,
        listener: Arc<dyn SessionListener>,
    ) -> Self {
        let info = Arc::new(RwLock::new(SessionInfo {
            id,
            remote_id: hex::encode(meta.remote_id),
            remote_addr: meta.remote_addr,
            local_port: meta.local_port,
            direction: meta.direction,
            state: SessionState::New,
            p2p_version: None,
            client_id: None,
            capabilities: Vec::new(),
            protocols: Vec::new(),
            ready: false,
            disconnect_reason: None,
            uptime_secs: 0,
        }));
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        Self {
            id,
            meta,
            state: SessionState::New,
            env,
            listener,
            outbound: Arc::new(OutboundGate::new()),
            handlers: BTreeMap::new(),
            remote_hello: None,
            hello_received: false,
            p2p_version: None,
            keep_alive: None,
            disconnect_reason: None,
            established_at: Instant::now(),
            info,
            command_tx,
            command_rx: Some(command_rx),
        }
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn meta(&self) -> &ConnectionMeta {
        &self.meta
    }

    pub fn remote_id(&self) -> &NodeId {
        &self.meta.remote_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_disconnected(&self) -> bool {
        self.state == SessionState::Disconnected
    }

    pub fn remote_hello(&self) -> Option<&Hello> {
        self.remote_hello.as_ref()
    }

    pub fn remote_capabilities(&self) -> &[Capability] {
        self.remote_hello
            .as_ref()
            .map(|h| h.capabilities.as_slice())
            .unwrap_or(&[])
    }

    pub fn p2p_version(&self) -> Option<u32> {
        self.p2p_version
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.disconnect_reason
    }

    pub fn has_handler(&self, protocol: &ProtocolId) -> bool {
        self.handlers.contains_key(protocol)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Negotiated version of an attached sub-protocol.
    pub fn protocol_version(&self, protocol: &ProtocolId) -> Option<u32> {
        self.handlers.get(protocol).map(|a| a.handler.version())
    }

    /// At least one sub-protocol is attached and all of them are initialized.
    pub fn sub_protocols_ready(&self) -> bool {
        !self.handlers.is_empty() && self.handlers.values().all(|a| a.initialized)
    }

    pub fn has_keep_alive(&self) -> bool {
        self.keep_alive
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    pub fn info(&self) -> SharedSessionInfo {
        Arc::clone(&self.info)
    }

    pub fn commands(&self) -> mpsc::UnboundedSender<SessionCommand> {
        self.command_tx.clone()
    }

    /// Receiver for [`SessionCommand`]s; taken once by the driver.
    pub fn take_commands(&mut self) -> Option<mpsc::UnboundedReceiver<SessionCommand>> {
        self.command_rx.take()
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Bind the transport and send our Hello.
    pub fn init(&mut self, sender: Arc<dyn PacketSender>) -> Result<(), SessionError> {
        if self.state != SessionState::New {
            return Err(SessionError::InvalidState(self.state));
        }

        let closed = sender.is_closed();
        self.outbound.attach(sender);
        if closed {
            self.mark_disconnected(
                DisconnectReason::TcpSubsystemError,
                DisconnectOriginator::Local,
                "transport closed before init",
            );
            return Err(SessionError::Transport(TransportError::Closed));
        }

        self.set_state(SessionState::Handshaking);

        let hello = Hello {
            p2p_version: P2P_VERSION,
            client_id: self.env.config.client_id.clone(),
            capabilities: self.env.config.capabilities.clone(),
            listen_port: self.env.config.listen_port,
            node_id: self.env.config.local_id,
        };
        if let Err(e) = self.send_p2p(&P2pMessage::Hello(hello)) {
            self.mark_disconnected(
                e.disconnect_reason(),
                DisconnectOriginator::Local,
                "failed to send hello",
            );
            return Err(e);
        }

        tracing::debug!(
            session = self.id,
            node = %short_id(&self.meta.remote_id),
            direction = ?self.meta.direction,
            "hello sent"
        );
        Ok(())
    }

    /// Process one inbound packet.
    pub fn receive_message(&mut self, packet: Packet) {
        match self.state {
            SessionState::New | SessionState::Disconnecting | SessionState::Disconnected => {
                tracing::debug!(
                    session = self.id,
                    code = packet.code,
                    state = ?self.state,
                    "packet ignored"
                );
                return;
            }
            SessionState::Handshaking | SessionState::Initialized => {}
        }

        if packet.code < BASE_PROTOCOL_LENGTH {
            self.receive_p2p(packet);
        } else {
            self.receive_sub_protocol(packet);
        }
    }

    /// Attach a sub-protocol handler at `offset` and let it start its handshake.
    pub fn attach_handler(
        &mut self,
        mut handler: Box<dyn SubProtocolHandler>,
        offset: u8,
    ) -> Result<(), SessionError> {
        if self.state != SessionState::Initialized {
            return Err(SessionError::InvalidState(self.state));
        }
        let protocol = handler.protocol();
        if self.handlers.contains_key(&protocol) {
            return Err(SessionError::HandlerAlreadyAttached(protocol));
        }

        let ctx = HandlerContext {
            node_id: self.meta.remote_id,
            offset,
            outbound: &self.outbound,
            codec: &*self.env.codec,
        };
        handler.init(&ctx)?;

        let label = format!("{}/{}", protocol, handler.version());
        let message_count = handler.message_count();
        self.handlers.insert(
            protocol,
            AttachedHandler {
                handler,
                offset,
                message_count,
                initialized: false,
            },
        );
        self.info.write().protocols.push(label);
        Ok(())
    }

    /// End the session. Idempotent: only the first call has any effect.
    ///
    /// On return keep-alive is stopped, the transport is closed, every
    /// handler has been detached and the listener has been told.
    pub fn mark_disconnected(
        &mut self,
        reason: DisconnectReason,
        originator: DisconnectOriginator,
        details: &str,
    ) {
        if matches!(
            self.state,
            SessionState::Disconnecting | SessionState::Disconnected
        ) {
            tracing::debug!(session = self.id, reason = ?reason, "already disconnecting");
            return;
        }

        let was_initialized = self.state == SessionState::Initialized;
        self.set_state(SessionState::Disconnecting);
        self.disconnect_reason = Some(reason);

        tracing::info!(
            session = self.id,
            node = %short_id(&self.meta.remote_id),
            reason = %reason,
            originator = ?originator,
            details,
            "peer disconnected"
        );

        self.stop_keep_alive();

        if originator == DisconnectOriginator::Local {
            let msg = P2pMessage::Disconnect(Disconnect { reason });
            if let Err(e) = self.send_p2p(&msg) {
                tracing::debug!(session = self.id, error = %e, "disconnect not delivered");
            }
        }
        self.outbound.close();

        for (protocol, mut attached) in std::mem::take(&mut self.handlers) {
            tracing::trace!(session = self.id, protocol = %protocol, "handler detached");
            attached.handler.on_detach();
        }

        if was_initialized || self.hello_received {
            self.env
                .stats
                .record_disconnect(&self.meta.remote_id, reason);
        }

        self.set_state(SessionState::Disconnected);
        {
            let mut info = self.info.write();
            info.disconnect_reason = Some(reason);
            info.ready = false;
        }

        let listener = Arc::clone(&self.listener);
        listener.on_session_disconnected(self);
    }

    // ── Base protocol ─────────────────────────────────────────────────────────

    fn receive_p2p(&mut self, packet: Packet) {
        let code = packet.code;
        let msg = match self.env.codec.decode_p2p(&packet) {
            Ok(msg) => msg,
            Err(e) => {
                self.breach(code, &e.to_string());
                return;
            }
        };

        match msg {
            P2pMessage::Hello(hello) => {
                if self.state != SessionState::Handshaking {
                    self.breach(code, "duplicate hello");
                    return;
                }
                self.receive_hello(hello);
            }
            P2pMessage::Disconnect(Disconnect { reason }) => {
                self.mark_disconnected(reason, DisconnectOriginator::Remote, "peer sent disconnect");
            }
            P2pMessage::Ping => {
                if self.state != SessionState::Initialized {
                    self.breach(code, "ping before hello");
                    return;
                }
                if let Err(e) = self.send_p2p(&P2pMessage::Pong) {
                    self.mark_disconnected(
                        e.disconnect_reason(),
                        DisconnectOriginator::Local,
                        "failed to send pong",
                    );
                }
            }
            P2pMessage::Pong => {
                if self.state != SessionState::Initialized {
                    self.breach(code, "pong before hello");
                    return;
                }
                tracing::trace!(session = self.id, "pong");
            }
        }
    }

    fn receive_hello(&mut self, hello: Hello) {
        let node_id = self.meta.remote_id;
        self.hello_received = true;
        self.env.stats.record_hello(
            &node_id,
            HandshakeFacts {
                p2p_version: Some(hello.p2p_version),
                client_id: Some(hello.client_id.clone()),
                ..Default::default()
            },
        );

        if hello.p2p_version < MIN_P2P_VERSION {
            self.env
                .stats
                .record_incompatibility(&node_id, FailedCompatibilityValidation::ProtocolVersion);
            self.mark_disconnected(
                DisconnectReason::IncompatibleP2PProtocolVersion,
                DisconnectOriginator::Local,
                "p2p version too low",
            );
            return;
        }
        if hello.node_id == self.env.config.local_id {
            self.mark_disconnected(
                DisconnectReason::IdentitySameAsSelf,
                DisconnectOriginator::Local,
                "connected to self",
            );
            return;
        }
        if hello.node_id != node_id {
            self.mark_disconnected(
                DisconnectReason::UnexpectedIdentity,
                DisconnectOriginator::Local,
                "hello node id differs from transport identity",
            );
            return;
        }

        let version = hello.p2p_version.min(P2P_VERSION);
        self.p2p_version = Some(version);
        {
            let mut info = self.info.write();
            info.p2p_version = Some(version);
            info.client_id = Some(hello.client_id.clone());
            info.capabilities = hello.capabilities.iter().map(ToString::to_string).collect();
        }
        self.remote_hello = Some(hello);
        self.set_state(SessionState::Initialized);

        tracing::info!(
            session = self.id,
            node = %short_id(&node_id),
            p2p_version = version,
            "session initialized"
        );

        let listener = Arc::clone(&self.listener);
        listener.on_session_initialized(self);

        // The listener may have disconnected us.
        if self.state == SessionState::Initialized {
            self.start_keep_alive();
        }
    }

    fn send_p2p(&self, msg: &P2pMessage) -> Result<(), SessionError> {
        let packet = self.env.codec.encode_p2p(msg)?;
        self.outbound.send(packet)?;
        Ok(())
    }

    // ── Sub-protocols ─────────────────────────────────────────────────────────

    fn receive_sub_protocol(&mut self, packet: Packet) {
        let code = packet.code;
        if self.state != SessionState::Initialized {
            self.breach(code, "sub-protocol message before hello");
            return;
        }

        let protocol = self
            .handlers
            .iter()
            .find(|(_, a)| a.contains(code))
            .map(|(p, _)| p.clone());
        let Some(protocol) = protocol else {
            self.breach(code, "no handler for message code");
            return;
        };

        let result = match self.handlers.get_mut(&protocol) {
            Some(attached) => {
                let ctx = HandlerContext {
                    node_id: self.meta.remote_id,
                    offset: attached.offset,
                    outbound: &self.outbound,
                    codec: &*self.env.codec,
                };
                let result = attached.handler.receive_message(&ctx, code, packet.data);
                if matches!(result, Ok(HandlerEvent::Initialized(_))) {
                    attached.initialized = true;
                }
                result
            }
            None => return,
        };

        match result {
            Ok(HandlerEvent::None) => {}
            Ok(HandlerEvent::Initialized(ready)) => {
                tracing::debug!(
                    session = self.id,
                    protocol = %protocol,
                    version = ready.version,
                    "sub-protocol initialized"
                );
                self.info.write().ready = self.sub_protocols_ready();
                let listener = Arc::clone(&self.listener);
                listener.on_sub_protocol_initialized(self, ready);
            }
            Ok(HandlerEvent::Disconnect { reason, details }) => {
                self.mark_disconnected(reason, DisconnectOriginator::Local, &details);
            }
            Err(SessionError::Transport(e)) => {
                self.mark_disconnected(
                    DisconnectReason::TcpSubsystemError,
                    DisconnectOriginator::Local,
                    &e.to_string(),
                );
            }
            Err(e) => self.breach(code, &e.to_string()),
        }
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn breach(&mut self, code: u8, details: &str) {
        tracing::warn!(
            session = self.id,
            node = %short_id(&self.meta.remote_id),
            code,
            details,
            "protocol breach"
        );
        self.mark_disconnected(
            DisconnectReason::BreachOfProtocol,
            DisconnectOriginator::Local,
            details,
        );
    }

    fn start_keep_alive(&mut self) {
        let ping = match self.env.codec.encode_p2p(&P2pMessage::Ping) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(session = self.id, error = %e, "cannot encode ping");
                return;
            }
        };
        self.keep_alive = keepalive::spawn(
            Arc::clone(&self.outbound),
            ping,
            self.env.config.keep_alive,
        );
        if self.keep_alive.is_none() {
            tracing::debug!(session = self.id, "no runtime, keep-alive not started");
        }
    }

    fn stop_keep_alive(&mut self) {
        self.outbound.set_keep_alive(false);
        if let Some(handle) = self.keep_alive.take() {
            handle.abort();
        }
    }

    fn set_state(&mut self, state: SessionState) {
        tracing::trace!(session = self.id, from = ?self.state, to = ?state, "state change");
        self.state = state;
        let mut info = self.info.write();
        info.state = state;
        info.uptime_secs = self.established_at.elapsed().as_secs();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop_keep_alive();
    }
}
