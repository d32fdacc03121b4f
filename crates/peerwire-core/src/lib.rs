//! peerwire-core — shared types, wire format, capability table and chain facts.
//! All other peerwire crates depend on this one.

pub mod capability;
pub mod chain;
pub mod codec;
pub mod config;
pub mod wire;

pub use capability::{Capability, CapabilityTable, ProtocolId, SharedCapability};
pub use chain::{ChainFacts, ChainHead, ForkFilter, ForkId};
pub use codec::{JsonCodec, PacketCodec};
pub use wire::{DisconnectReason, EthMessage, Hash, NodeId, P2pMessage, Packet, Status};
