//! peerwire-services — sessions, sub-protocol handlers, and the protocol
//! manager, plus the registries they report into.

pub mod compat;
pub mod driver;
pub mod eth;
pub mod keepalive;
pub mod node_stats;
pub mod pools;
pub mod protocol_manager;
pub mod session;
pub mod transport;

pub use compat::{Compatibility, CompatibilityValidator};
pub use driver::SessionDriver;
pub use eth::EthHandler;
pub use node_stats::{FailedCompatibilityValidation, HandshakeFacts, NodeStats, NodeStatsTracker};
pub use pools::{ChainPeer, PooledTxSource, PooledTxTracker, SyncPeerPool, SyncPeerRegistry};
pub use protocol_manager::{ManagerConfig, ProtocolManager};
pub use session::{
    ConnectionMeta, Direction, DisconnectOriginator, Session, SessionCommand, SessionError,
    SessionId, SessionInfo, SessionListener, SessionState,
};
pub use transport::{ChannelSender, OutboundGate, PacketSender, TransportError};
