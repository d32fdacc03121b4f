//! Chain compatibility checks run on the peer's Status.
//!
//! Checks run in a fixed order and the first failure wins:
//! network id, genesis hash, protocol version, fork id.

use std::fmt;

use peerwire_core::chain::{ChainFacts, ForkFilter};
use peerwire_core::wire::{short_id, NodeId, Status};

use crate::node_stats::{FailedCompatibilityValidation, NodeStatsTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compatibility {
    Compatible,
    NetworkIdMismatch,
    GenesisHashMismatch,
    ProtocolVersionTooLow,
    ForkIdMismatch,
}

impl Compatibility {
    pub fn is_compatible(self) -> bool {
        self == Compatibility::Compatible
    }

    /// The sticky stats reason for a failed check.
    pub fn failure(self) -> Option<FailedCompatibilityValidation> {
        match self {
            Compatibility::Compatible => None,
            Compatibility::NetworkIdMismatch => Some(FailedCompatibilityValidation::NetworkId),
            Compatibility::GenesisHashMismatch => Some(FailedCompatibilityValidation::GenesisHash),
            Compatibility::ProtocolVersionTooLow => {
                Some(FailedCompatibilityValidation::ProtocolVersion)
            }
            Compatibility::ForkIdMismatch => Some(FailedCompatibilityValidation::ForkId),
        }
    }
}

impl fmt::Display for Compatibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Compatibility::Compatible => "compatible",
            Compatibility::NetworkIdMismatch => "network id mismatch",
            Compatibility::GenesisHashMismatch => "genesis hash mismatch",
            Compatibility::ProtocolVersionTooLow => "protocol version too low",
            Compatibility::ForkIdMismatch => "fork id mismatch",
        };
        f.write_str(s)
    }
}

/// Decides whether a peer follows our chain. Stateless apart from the
/// stats sink it reports failures to.
#[derive(Clone)]
pub struct CompatibilityValidator {
    stats: NodeStatsTracker,
}

impl CompatibilityValidator {
    pub fn new(stats: NodeStatsTracker) -> Self {
        Self { stats }
    }

    /// Pure decision, no side effects.
    ///
    /// A peer announcing a higher protocol version than the negotiated one
    /// is tolerated; only a lower one fails.
    pub fn check(
        local: &ChainFacts,
        fork_filter: &ForkFilter,
        negotiated_version: u32,
        remote: &Status,
    ) -> Compatibility {
        if remote.network_id != local.network_id {
            return Compatibility::NetworkIdMismatch;
        }
        if remote.genesis_hash != local.genesis_hash {
            return Compatibility::GenesisHashMismatch;
        }
        if remote.protocol_version < negotiated_version {
            return Compatibility::ProtocolVersionTooLow;
        }
        if fork_filter.validate(remote.fork_id).is_err() {
            return Compatibility::ForkIdMismatch;
        }
        Compatibility::Compatible
    }

    /// Run the checks and record a failure in the peer's stats.
    pub fn validate(
        &self,
        node_id: &NodeId,
        local: &ChainFacts,
        negotiated_version: u32,
        remote: &Status,
    ) -> Compatibility {
        let fork_filter = local.fork_filter();
        let outcome = Self::check(local, &fork_filter, negotiated_version, remote);

        if let Some(reason) = outcome.failure() {
            tracing::info!(
                node = %short_id(node_id),
                outcome = %outcome,
                remote_network = remote.network_id,
                remote_version = remote.protocol_version,
                "peer failed compatibility validation"
            );
            self.stats.record_incompatibility(node_id, reason);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_bigint::BigUint;
    use peerwire_core::chain::{ChainHead, ForkId};

    fn facts() -> ChainFacts {
        ChainFacts {
            network_id: 1,
            chain_id: Some(1),
            genesis_hash: [0x11; 32],
            fork_blocks: vec![100, 200],
            head: ChainHead {
                number: 150,
                hash: [0x22; 32],
                total_difficulty: BigUint::from(1000u32),
            },
        }
    }

    fn matching() -> Status {
        facts().status(68)
    }

    #[test]
    fn matching_status_is_compatible() {
        let validator = CompatibilityValidator::new(NodeStatsTracker::default());
        let outcome = validator.validate(&[1; 32], &facts(), 68, &matching());
        assert_eq!(outcome, Compatibility::Compatible);
    }

    #[test]
    fn first_failure_wins() {
        let local = facts();
        let filter = local.fork_filter();
        let mut remote = matching();
        remote.network_id = 5;
        remote.genesis_hash = [0x99; 32];
        remote.fork_id = ForkId {
            hash: [0, 0, 0, 0],
            next: 0,
        };
        assert_eq!(
            CompatibilityValidator::check(&local, &filter, 68, &remote),
            Compatibility::NetworkIdMismatch
        );

        remote.network_id = 1;
        assert_eq!(
            CompatibilityValidator::check(&local, &filter, 68, &remote),
            Compatibility::GenesisHashMismatch
        );

        remote.genesis_hash = local.genesis_hash;
        assert_eq!(
            CompatibilityValidator::check(&local, &filter, 68, &remote),
            Compatibility::ForkIdMismatch
        );
    }

    #[test]
    fn lower_protocol_version_fails_higher_is_tolerated() {
        let local = facts();
        let filter = local.fork_filter();
        let mut remote = matching();

        remote.protocol_version = 66;
        assert_eq!(
            CompatibilityValidator::check(&local, &filter, 67, &remote),
            Compatibility::ProtocolVersionTooLow
        );

        remote.protocol_version = 68;
        assert_eq!(
            CompatibilityValidator::check(&local, &filter, 67, &remote),
            Compatibility::Compatible
        );
    }

    #[test]
    fn failure_is_written_to_stats() {
        let stats = NodeStatsTracker::default();
        let validator = CompatibilityValidator::new(stats.clone());
        let mut remote = matching();
        remote.genesis_hash = [0x77; 32];

        let outcome = validator.validate(&[9; 32], &facts(), 68, &remote);
        assert_eq!(outcome, Compatibility::GenesisHashMismatch);
        assert_eq!(
            stats.get(&[9; 32]).unwrap().failed_compatibility_validation,
            FailedCompatibilityValidation::GenesisHash
        );
    }

    #[test]
    fn success_does_not_touch_stats() {
        let stats = NodeStatsTracker::default();
        let validator = CompatibilityValidator::new(stats.clone());
        validator.validate(&[9; 32], &facts(), 68, &matching());
        assert!(stats.get(&[9; 32]).is_none());
    }
}
