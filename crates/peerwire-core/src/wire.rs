//! peerwire wire format — the message values exchanged on a session.
//!
//! Payloads are typed values; turning them into bytes is the job of a
//! [`PacketCodec`](crate::codec::PacketCodec). The only fixed-layout type in
//! this module is the transport frame header, which uses zerocopy derives so
//! the TCP adapter can read and write it without copying.
//!
//! Message codes follow devp2p: the base protocol owns codes 0x00..0x10 and
//! every shared sub-protocol gets a contiguous range after that.

use std::fmt;

use bytes::Bytes;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::capability::Capability;
use crate::chain::ForkId;

/// Remote node identity — the public key authenticated by the transport.
pub type NodeId = [u8; 32];

/// 32-byte block or transaction hash.
pub type Hash = [u8; 32];

/// Short hex prefix of a node id, for log fields.
pub fn short_id(id: &NodeId) -> String {
    hex::encode(&id[..8])
}

// ── Packets ───────────────────────────────────────────────────────────────────

/// An opaque framed message as delivered by the transport.
///
/// `code` is the absolute message id on the session (base protocol codes
/// plus sub-protocol offsets); `data` is the encoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub code: u8,
    pub data: Bytes,
}

impl Packet {
    pub fn new(code: u8, data: impl Into<Bytes>) -> Self {
        Self {
            code,
            data: data.into(),
        }
    }
}

// ── Base protocol ─────────────────────────────────────────────────────────────

/// Number of message codes reserved for the base protocol.
/// Sub-protocol offsets start here.
pub const BASE_PROTOCOL_LENGTH: u8 = 0x10;

/// Base protocol version this node speaks.
pub const P2P_VERSION: u32 = 5;

/// Lowest base protocol version accepted from a peer.
pub const MIN_P2P_VERSION: u32 = 4;

/// Base protocol message codes.
pub mod p2p {
    pub const HELLO: u8 = 0x00;
    pub const DISCONNECT: u8 = 0x01;
    pub const PING: u8 = 0x02;
    pub const PONG: u8 = 0x03;
}

/// First message on every session, sent by both sides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub p2p_version: u32,
    pub client_id: String,
    pub capabilities: Vec<Capability>,
    pub listen_port: u16,
    pub node_id: NodeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disconnect {
    pub reason: DisconnectReason,
}

/// devp2p disconnect reasons. The discriminants are the on-wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DisconnectReason {
    DisconnectRequested = 0x00,
    TcpSubsystemError = 0x01,
    BreachOfProtocol = 0x02,
    UselessPeer = 0x03,
    TooManyPeers = 0x04,
    AlreadyConnected = 0x05,
    IncompatibleP2PProtocolVersion = 0x06,
    NullNodeIdentity = 0x07,
    ClientQuitting = 0x08,
    UnexpectedIdentity = 0x09,
    IdentitySameAsSelf = 0x0a,
    ReceiveMessageTimeout = 0x0b,
    /// Sub-protocol rejected the peer, e.g. wrong chain.
    SubprotocolSpecific = 0x10,
}

impl TryFrom<u8> for DisconnectReason {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use DisconnectReason::*;
        Ok(match value {
            0x00 => DisconnectRequested,
            0x01 => TcpSubsystemError,
            0x02 => BreachOfProtocol,
            0x03 => UselessPeer,
            0x04 => TooManyPeers,
            0x05 => AlreadyConnected,
            0x06 => IncompatibleP2PProtocolVersion,
            0x07 => NullNodeIdentity,
            0x08 => ClientQuitting,
            0x09 => UnexpectedIdentity,
            0x0a => IdentitySameAsSelf,
            0x0b => ReceiveMessageTimeout,
            0x10 => SubprotocolSpecific,
            other => return Err(WireError::UnknownDisconnectReason(other)),
        })
    }
}

impl From<DisconnectReason> for u8 {
    fn from(r: DisconnectReason) -> u8 {
        r as u8
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DisconnectReason::DisconnectRequested => "disconnect requested",
            DisconnectReason::TcpSubsystemError => "tcp subsystem error",
            DisconnectReason::BreachOfProtocol => "breach of protocol",
            DisconnectReason::UselessPeer => "useless peer",
            DisconnectReason::TooManyPeers => "too many peers",
            DisconnectReason::AlreadyConnected => "already connected",
            DisconnectReason::IncompatibleP2PProtocolVersion => "incompatible p2p protocol version",
            DisconnectReason::NullNodeIdentity => "null node identity",
            DisconnectReason::ClientQuitting => "client quitting",
            DisconnectReason::UnexpectedIdentity => "unexpected identity",
            DisconnectReason::IdentitySameAsSelf => "identity same as self",
            DisconnectReason::ReceiveMessageTimeout => "receive message timeout",
            DisconnectReason::SubprotocolSpecific => "subprotocol specific",
        };
        f.write_str(s)
    }
}

/// Base protocol messages, handled by the session itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum P2pMessage {
    Hello(Hello),
    Disconnect(Disconnect),
    Ping,
    Pong,
}

impl P2pMessage {
    pub fn code(&self) -> u8 {
        match self {
            P2pMessage::Hello(_) => p2p::HELLO,
            P2pMessage::Disconnect(_) => p2p::DISCONNECT,
            P2pMessage::Ping => p2p::PING,
            P2pMessage::Pong => p2p::PONG,
        }
    }
}

// ── eth sub-protocol ──────────────────────────────────────────────────────────

/// eth message ids, relative to the capability offset.
pub mod eth {
    pub const STATUS: u8 = 0x00;
    pub const NEW_BLOCK_HASHES: u8 = 0x01;
    pub const TRANSACTIONS: u8 = 0x02;
    pub const GET_BLOCK_HEADERS: u8 = 0x03;
    pub const BLOCK_HEADERS: u8 = 0x04;
    pub const GET_BLOCK_BODIES: u8 = 0x05;
    pub const BLOCK_BODIES: u8 = 0x06;
    pub const NEW_BLOCK: u8 = 0x07;
    pub const NEW_POOLED_TRANSACTION_HASHES: u8 = 0x08;
    pub const GET_POOLED_TRANSACTIONS: u8 = 0x09;
    pub const POOLED_TRANSACTIONS: u8 = 0x0a;
    pub const GET_RECEIPTS: u8 = 0x0f;
    pub const RECEIPTS: u8 = 0x10;

    /// Size of the eth message id range (eth/66 through eth/68).
    pub const MESSAGE_COUNT: u8 = 0x11;
}

/// Chain handshake message, sent by both sides once eth is negotiated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub protocol_version: u32,
    pub network_id: u64,
    pub total_difficulty: BigUint,
    pub best_hash: Hash,
    pub genesis_hash: Hash,
    pub fork_id: ForkId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHashNumber {
    pub hash: Hash,
    pub number: u64,
}

/// eth messages the session layer interprets. Everything else is carried
/// opaquely for the chain subsystems.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EthMessage {
    Status(Status),
    NewBlockHashes(Vec<BlockHashNumber>),
    NewPooledTransactionHashes(Vec<Hash>),
    Other { id: u8, payload: Bytes },
}

impl EthMessage {
    /// Message id relative to the eth offset.
    pub fn id(&self) -> u8 {
        match self {
            EthMessage::Status(_) => eth::STATUS,
            EthMessage::NewBlockHashes(_) => eth::NEW_BLOCK_HASHES,
            EthMessage::NewPooledTransactionHashes(_) => eth::NEW_POOLED_TRANSACTION_HASHES,
            EthMessage::Other { id, .. } => *id,
        }
    }
}

// ── Frame header ──────────────────────────────────────────────────────────────

/// Header preceding every packet on the TCP transport.
///
/// Wire size: 6 bytes. `length` is little-endian on the wire; use
/// [`FrameHeader::new`] and [`FrameHeader::payload_len`] instead of touching
/// the packed field directly.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FrameHeader {
    /// Payload length in bytes, not including this header.
    pub length: u32,
    /// Absolute message code of the packet.
    pub code: u8,
    /// Frame format version. Currently 0x01.
    pub version: u8,
}

assert_eq_size!(FrameHeader, [u8; 6]);

/// Current frame format version.
pub const FRAME_VERSION: u8 = 0x01;

/// Largest payload a single frame may carry.
pub const MAX_FRAME_PAYLOAD: usize = 10 * 1024 * 1024;

impl FrameHeader {
    pub fn new(code: u8, payload_len: usize) -> Result<Self, WireError> {
        if payload_len > MAX_FRAME_PAYLOAD {
            return Err(WireError::PayloadTooLarge(payload_len));
        }
        Ok(Self {
            length: (payload_len as u32).to_le(),
            code,
            version: FRAME_VERSION,
        })
    }

    pub fn payload_len(&self) -> usize {
        let length = self.length;
        u32::from_le(length) as usize
    }

    /// Reject headers this build cannot interpret.
    pub fn validate(&self) -> Result<(), WireError> {
        if self.version != FRAME_VERSION {
            return Err(WireError::UnknownFrameVersion(self.version));
        }
        let len = self.payload_len();
        if len > MAX_FRAME_PAYLOAD {
            return Err(WireError::PayloadTooLarge(len));
        }
        Ok(())
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown message code: 0x{0:02x}")]
    UnknownMessage(u8),

    #[error("unknown disconnect reason: 0x{0:02x}")]
    UnknownDisconnectReason(u8),

    #[error("malformed payload for code 0x{code:02x}: {reason}")]
    Malformed { code: u8, reason: String },

    #[error("payload length {0} exceeds maximum {}", MAX_FRAME_PAYLOAD)]
    PayloadTooLarge(usize),

    #[error("unknown frame version: 0x{0:02x}")]
    UnknownFrameVersion(u8),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
