//! Local chain facts and fork identification.
//!
//! The session layer never executes blocks; it only needs a handful of
//! read-only facts to decide whether a peer follows the same chain: network
//! id, genesis hash, the fork schedule, and the current head.
//!
//! Fork ids follow the EIP-2124 shape — a 4-byte checksum over the genesis
//! hash and every activated fork block, plus the next scheduled fork. The
//! checksum here is the first four bytes of a BLAKE3 digest.

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::wire::{Hash, Status};

/// Compact summary of past and upcoming forks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForkId {
    pub hash: [u8; 4],
    /// Block of the next scheduled fork, 0 if none is known.
    pub next: u64,
}

/// Current best block as seen by the local chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainHead {
    pub number: u64,
    pub hash: Hash,
    pub total_difficulty: BigUint,
}

/// Read-only facts describing the chain this node follows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainFacts {
    pub network_id: u64,
    /// Chain id, when the network distinguishes one from the network id.
    pub chain_id: Option<u64>,
    pub genesis_hash: Hash,
    /// Fork activation blocks, any order.
    pub fork_blocks: Vec<u64>,
    pub head: ChainHead,
}

impl ChainFacts {
    pub fn fork_filter(&self) -> ForkFilter {
        ForkFilter::new(self.genesis_hash, &self.fork_blocks, self.head.number)
    }

    /// The Status message we send for a negotiated eth version.
    pub fn status(&self, protocol_version: u32) -> Status {
        Status {
            protocol_version,
            network_id: self.network_id,
            total_difficulty: self.head.total_difficulty.clone(),
            best_hash: self.head.hash,
            genesis_hash: self.genesis_hash,
            fork_id: self.fork_filter().current(),
        }
    }
}

/// Why a remote fork id was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ForkIdError {
    /// Remote is on a fork we passed and does not announce the upgrade.
    #[error("remote fork id is stale")]
    RemoteStale,

    /// Remote follows a different fork schedule, or announces a fork we passed without it.
    #[error("local fork schedule incompatible or stale")]
    LocalIncompatibleOrStale,
}

/// Computes the local fork id and validates remote ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkFilter {
    /// Fork blocks, ascending, without duplicates or block 0.
    forks: Vec<u64>,
    /// `sums[i]` is the checksum after the first `i` forks.
    sums: Vec<[u8; 4]>,
    head: u64,
}

impl ForkFilter {
    pub fn new(genesis_hash: Hash, fork_blocks: &[u64], head: u64) -> Self {
        let mut forks: Vec<u64> = fork_blocks.iter().copied().filter(|b| *b > 0).collect();
        forks.sort_unstable();
        forks.dedup();

        let sums = (0..=forks.len())
            .map(|i| fork_checksum(&genesis_hash, &forks[..i]))
            .collect();

        Self { forks, sums, head }
    }

    /// Number of forks activated at the current head.
    fn passed(&self) -> usize {
        self.forks.iter().take_while(|f| **f <= self.head).count()
    }

    pub fn current(&self) -> ForkId {
        let i = self.passed();
        ForkId {
            hash: self.sums[i],
            next: self.forks.get(i).copied().unwrap_or(0),
        }
    }

    /// Validate a remote fork id against the local schedule.
    pub fn validate(&self, remote: ForkId) -> Result<(), ForkIdError> {
        let passed = self.passed();

        for (idx, sum) in self.sums.iter().enumerate() {
            if *sum != remote.hash {
                continue;
            }

            if idx == passed {
                // Same fork state; reject if the peer expects a fork we already passed.
                if remote.next > 0 && self.head >= remote.next {
                    return Err(ForkIdError::LocalIncompatibleOrStale);
                }
                return Ok(());
            }

            if idx < passed {
                // Peer lags behind; it must at least know about the next fork.
                return if remote.next == self.forks[idx] {
                    Ok(())
                } else {
                    Err(ForkIdError::RemoteStale)
                };
            }

            // Peer is ahead on a schedule we know; we are the one to catch up.
            return Ok(());
        }

        Err(ForkIdError::LocalIncompatibleOrStale)
    }
}

fn fork_checksum(genesis_hash: &Hash, forks: &[u64]) -> [u8; 4] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(genesis_hash);
    for fork in forks {
        hasher.update(&fork.to_be_bytes());
    }
    let digest = hasher.finalize();
    let mut out = [0u8; 4];
    out.copy_from_slice(&digest.as_bytes()[..4]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const GENESIS: Hash = [0x11; 32];

    #[test]
    fn current_tracks_head() {
        let forks = [200, 100, 100, 0];
        let before = ForkFilter::new(GENESIS, &forks, 50).current();
        assert_eq!(before.next, 100);

        let after_first = ForkFilter::new(GENESIS, &forks, 100).current();
        assert_ne!(after_first.hash, before.hash);
        assert_eq!(after_first.next, 200);

        assert_eq!(ForkFilter::new(GENESIS, &forks, 1_000).current().next, 0);
    }

    #[test]
    fn identical_fork_ids_are_compatible() {
        let filter = ForkFilter::new(GENESIS, &[100, 200], 150);
        assert!(filter.validate(filter.current()).is_ok());
    }

    #[test]
    fn remote_announcing_a_passed_fork_is_rejected() {
        let filter = ForkFilter::new(GENESIS, &[100, 200], 150);
        let mut remote = filter.current();
        remote.next = 120;
        assert_eq!(
            filter.validate(remote),
            Err(ForkIdError::LocalIncompatibleOrStale)
        );
    }

    #[test]
    fn lagging_remote_must_know_next_fork() {
        let ahead = ForkFilter::new(GENESIS, &[100, 200], 150);
        let behind = ForkFilter::new(GENESIS, &[100, 200], 50);
        assert!(ahead.validate(behind.current()).is_ok());

        let unaware = ForkFilter::new(GENESIS, &[], 50).current();
        assert_eq!(ahead.validate(unaware), Err(ForkIdError::RemoteStale));
    }

    #[test]
    fn remote_ahead_on_known_schedule_is_accepted() {
        let behind = ForkFilter::new(GENESIS, &[100, 200], 50);
        let ahead = ForkFilter::new(GENESIS, &[100, 200], 250);
        assert!(behind.validate(ahead.current()).is_ok());
    }

    #[test]
    fn different_genesis_is_rejected() {
        let local = ForkFilter::new(GENESIS, &[100], 150);
        let other = ForkFilter::new([0x22; 32], &[100], 150);
        assert_eq!(
            local.validate(other.current()),
            Err(ForkIdError::LocalIncompatibleOrStale)
        );
    }

    #[test]
    fn status_carries_local_facts() {
        let facts = ChainFacts {
            network_id: 1,
            chain_id: Some(1),
            genesis_hash: GENESIS,
            fork_blocks: vec![100],
            head: ChainHead {
                number: 150,
                hash: [0x33; 32],
                total_difficulty: BigUint::from(17u32),
            },
        };
        let status = facts.status(68);
        assert_eq!(status.protocol_version, 68);
        assert_eq!(status.network_id, 1);
        assert_eq!(status.best_hash, [0x33; 32]);
        assert_eq!(status.total_difficulty, BigUint::from(17u32));
        assert_eq!(status.fork_id, facts.fork_filter().current());
    }
}
