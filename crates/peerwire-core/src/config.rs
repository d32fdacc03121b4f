//! Configuration system for peerwire.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $PEERWIRE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/peerwire/config.toml
//!   3. ~/.config/peerwire/config.toml

use std::path::{Path, PathBuf};
use std::time::Duration;

use num_bigint::BigUint;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::capability::{CapabilityTable, ETH_VERSIONS};
use crate::chain::{ChainFacts, ChainHead};
use crate::wire::{Hash, NodeId};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerwireConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub chain: ChainConfig,
    pub protocol: ProtocolConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Path to the hex-encoded node id. Generated on first run.
    pub node_id_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// TCP port for inbound peer connections.
    pub listen_port: u16,
    /// Port of the local HTTP API.
    pub api_port: u16,
    /// Peers dialled at startup, as "host:port".
    pub bootnodes: Vec<String>,
    /// Inbound + outbound session limit.
    pub max_peers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub network_id: u64,
    pub chain_id: Option<u64>,
    /// Genesis block hash, hex.
    pub genesis_hash: String,
    /// Fork activation blocks.
    pub fork_blocks: Vec<u64>,
    pub head_number: u64,
    /// Head block hash, hex. Empty = genesis.
    pub head_hash: String,
    /// Total difficulty at head, decimal.
    pub total_difficulty: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Client id announced in Hello.
    pub client_id: String,
    /// eth versions to advertise. Versions this build cannot speak are ignored.
    pub eth_versions: Vec<u32>,
    /// Ping interval on initialized sessions.
    pub keep_alive_secs: u64,
    /// Time allowed from connect to a validated Status.
    pub handshake_timeout_secs: u64,
    /// Maximum node stats records kept across reconnects.
    pub node_stats_capacity: usize,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

/// Ethereum mainnet genesis hash.
pub const MAINNET_GENESIS: &str =
    "d4e56740f876aef8c010b86a40d5f56745a118d0906a34e69aec8c0db1cb8fa3";

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            node_id_path: config_dir().join("node_id"),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_port: 30303,
            api_port: 9545,
            bootnodes: Vec::new(),
            max_peers: 50,
        }
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            network_id: 1,
            chain_id: Some(1),
            genesis_hash: MAINNET_GENESIS.to_string(),
            fork_blocks: vec![
                1_150_000, 1_920_000, 2_463_000, 2_675_000, 4_370_000, 7_280_000, 9_069_000,
                9_200_000, 12_244_000, 12_965_000, 13_773_000, 15_050_000,
            ],
            head_number: 0,
            head_hash: String::new(),
            total_difficulty: "17179869184".to_string(),
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            client_id: format!("peerwire/{}", env!("CARGO_PKG_VERSION")),
            eth_versions: ETH_VERSIONS.to_vec(),
            keep_alive_secs: 15,
            handshake_timeout_secs: 10,
            node_stats_capacity: 1024,
        }
    }
}

// ── Derived values ────────────────────────────────────────────────────────────

impl ChainConfig {
    /// Parse into the facts the session layer validates peers against.
    pub fn facts(&self) -> Result<ChainFacts, ConfigError> {
        let genesis_hash = parse_hash("chain.genesis_hash", &self.genesis_hash)?;
        let head_hash = if self.head_hash.is_empty() {
            genesis_hash
        } else {
            parse_hash("chain.head_hash", &self.head_hash)?
        };
        let total_difficulty = self
            .total_difficulty
            .parse::<BigUint>()
            .map_err(|e| ConfigError::InvalidValue("chain.total_difficulty", e.to_string()))?;

        Ok(ChainFacts {
            network_id: self.network_id,
            chain_id: self.chain_id,
            genesis_hash,
            fork_blocks: self.fork_blocks.clone(),
            head: ChainHead {
                number: self.head_number,
                hash: head_hash,
                total_difficulty,
            },
        })
    }
}

impl ProtocolConfig {
    pub fn capability_table(&self) -> CapabilityTable {
        let versions: Vec<u32> = self
            .eth_versions
            .iter()
            .copied()
            .filter(|v| ETH_VERSIONS.contains(v))
            .collect();
        CapabilityTable::eth(&versions)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs.max(1))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs.max(1))
    }
}

impl IdentityConfig {
    /// Read the node id, or generate and persist a fresh one.
    pub fn load_or_generate(&self) -> Result<NodeId, ConfigError> {
        load_or_generate_node_id(&self.node_id_path)
    }
}

fn load_or_generate_node_id(path: &Path) -> Result<NodeId, ConfigError> {
    if path.exists() {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        return parse_hash("identity.node_id", text.trim());
    }

    let mut id = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut id);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
    }
    std::fs::write(path, hex::encode(id))
        .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
    Ok(id)
}

/// Parse a 32-byte hex value, with or without a 0x prefix.
pub fn parse_hash(field: &'static str, value: &str) -> Result<Hash, ConfigError> {
    let value = value.strip_prefix("0x").unwrap_or(value);
    let bytes =
        hex::decode(value).map_err(|e| ConfigError::InvalidValue(field, e.to_string()))?;
    if bytes.len() != 32 {
        return Err(ConfigError::InvalidValue(
            field,
            format!("expected 32 bytes, got {}", bytes.len()),
        ));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("peerwire")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid {0}: {1}")]
    InvalidValue(&'static str, String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl PeerwireConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            PeerwireConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("PEERWIRE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&PeerwireConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply PEERWIRE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PEERWIRE_NETWORK__LISTEN_PORT") {
            if let Ok(p) = v.parse() {
                self.network.listen_port = p;
            }
        }
        if let Ok(v) = std::env::var("PEERWIRE_NETWORK__API_PORT") {
            if let Ok(p) = v.parse() {
                self.network.api_port = p;
            }
        }
        if let Ok(v) = std::env::var("PEERWIRE_NETWORK__BOOTNODES") {
            self.network.bootnodes = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(v) = std::env::var("PEERWIRE_CHAIN__NETWORK_ID") {
            if let Ok(id) = v.parse() {
                self.chain.network_id = id;
            }
        }
        if let Ok(v) = std::env::var("PEERWIRE_PROTOCOL__CLIENT_ID") {
            self.protocol.client_id = v;
        }
        if let Ok(v) = std::env::var("PEERWIRE_PROTOCOL__KEEP_ALIVE_SECS") {
            if let Ok(secs) = v.parse() {
                self.protocol.keep_alive_secs = secs;
            }
        }
    }
}
