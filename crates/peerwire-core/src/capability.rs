//! Capabilities — `(protocol name, version)` pairs and the local table of
//! supported sub-protocols.
//!
//! The table is an immutable value built from config at startup. It answers
//! "what is the highest version of X we speak" and computes the shared
//! capability set with a peer, including the message-id offset each shared
//! protocol occupies on the session.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::wire::{eth, BASE_PROTOCOL_LENGTH};

/// Canonical name of the chain wire protocol.
pub const ETH: &str = "eth";

/// Versions of eth this build can speak.
pub const ETH_VERSIONS: [u32; 3] = [66, 67, 68];

/// A protocol a peer claims to support.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    pub version: u32,
}

impl Capability {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

/// Sub-protocols the session layer knows by name. Anything else is carried
/// as `Other` so unknown capabilities survive a round trip through the table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProtocolId {
    Eth,
    Other(String),
}

impl ProtocolId {
    pub fn from_name(name: &str) -> Self {
        match name {
            ETH => ProtocolId::Eth,
            other => ProtocolId::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ProtocolId::Eth => ETH,
            ProtocolId::Other(name) => name,
        }
    }

    /// Chain protocols gate whether a peer is useful at all.
    pub fn is_chain(&self) -> bool {
        matches!(self, ProtocolId::Eth)
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One locally supported sub-protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolSpec {
    pub id: ProtocolId,
    /// Supported versions, ascending, no duplicates.
    pub versions: Vec<u32>,
    /// Size of the message id range the protocol occupies.
    pub message_count: u8,
}

impl ProtocolSpec {
    pub fn new(id: ProtocolId, versions: &[u32], message_count: u8) -> Self {
        let mut versions = versions.to_vec();
        versions.sort_unstable();
        versions.dedup();
        Self {
            id,
            versions,
            message_count,
        }
    }

    pub fn highest(&self) -> Option<u32> {
        self.versions.last().copied()
    }
}

/// A capability both sides support, with its position on the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedCapability {
    pub protocol: ProtocolId,
    pub version: u32,
    /// First absolute message code of this protocol.
    pub offset: u8,
    pub message_count: u8,
}

/// The local capability table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityTable {
    /// Sorted by protocol name; offsets are assigned in this order.
    protocols: Vec<ProtocolSpec>,
}

impl CapabilityTable {
    pub fn new(protocols: Vec<ProtocolSpec>) -> Self {
        let mut protocols: Vec<ProtocolSpec> = protocols
            .into_iter()
            .filter(|p| !p.versions.is_empty())
            .collect();
        protocols.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        protocols.dedup_by(|a, b| a.id == b.id);
        Self { protocols }
    }

    /// Table with only the eth protocol at the given versions.
    pub fn eth(versions: &[u32]) -> Self {
        Self::new(vec![ProtocolSpec::new(
            ProtocolId::Eth,
            versions,
            eth::MESSAGE_COUNT,
        )])
    }

    pub fn protocols(&self) -> &[ProtocolSpec] {
        &self.protocols
    }

    pub fn spec(&self, id: &ProtocolId) -> Option<&ProtocolSpec> {
        self.protocols.iter().find(|p| &p.id == id)
    }

    /// Highest locally supported version of `name`. Independent of any peer.
    pub fn highest_version(&self, name: &str) -> Option<u32> {
        self.spec(&ProtocolId::from_name(name))
            .and_then(ProtocolSpec::highest)
    }

    pub fn supports(&self, name: &str, version: u32) -> bool {
        self.spec(&ProtocolId::from_name(name))
            .map(|p| p.versions.contains(&version))
            .unwrap_or(false)
    }

    /// Every `(name, version)` pair we advertise in Hello.
    pub fn advertised(&self) -> Vec<Capability> {
        self.protocols
            .iter()
            .flat_map(|p| {
                p.versions
                    .iter()
                    .map(move |v| Capability::new(p.id.as_str(), *v))
            })
            .collect()
    }

    /// Shared capabilities with a peer.
    ///
    /// For every local protocol the highest version present on both sides is
    /// selected; a peer listing the same name several times is fine. Offsets
    /// are assigned in name order starting at `BASE_PROTOCOL_LENGTH`.
    pub fn negotiate(&self, remote: &[Capability]) -> Vec<SharedCapability> {
        let mut shared = Vec::new();
        let mut offset = BASE_PROTOCOL_LENGTH;

        for spec in &self.protocols {
            let best = remote
                .iter()
                .filter(|c| c.name == spec.id.as_str() && spec.versions.contains(&c.version))
                .map(|c| c.version)
                .max();

            let Some(version) = best else {
                continue;
            };

            shared.push(SharedCapability {
                protocol: spec.id.clone(),
                version,
                offset,
                message_count: spec.message_count,
            });

            offset = match offset.checked_add(spec.message_count) {
                Some(next) => next,
                None => break,
            };
        }

        shared
    }
}

impl Default for CapabilityTable {
    fn default() -> Self {
        Self::eth(&ETH_VERSIONS)
    }
}
