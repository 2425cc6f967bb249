//! Configuration system for Basalt storage nodes.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $BASALT_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/basalt/config.toml
//!   3. ~/.config/basalt/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::checksum::{ChecksumSpec, ChecksumType};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node: NodeSection,
    pub transfer: TransferConfig,
    pub balancer: BalancerConfig,
    pub security: SecurityConfig,
    pub delta: DeltaConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Root of the block storage tree.
    pub data_dir: PathBuf,
    /// Address the data-transfer listener binds.
    pub listen_addr: String,
    /// Address this node advertises to peers. Empty = the bound address.
    pub xfer_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub socket_timeout_ms: u64,
    pub socket_write_timeout_ms: u64,
    /// Idle wait for the next op on a reused connection. 0 = one op per connection.
    pub keepalive_timeout_ms: u64,
    /// Added per downstream hop when reading from a mirror.
    pub read_timeout_extension_ms: u64,
    /// Added per downstream hop when writing to a mirror.
    pub write_timeout_extension_ms: u64,
    pub block_size: u64,
    /// Expected size of a replica moved by REPLACE_BLOCK.
    pub estimate_block_size: u64,
    /// Data bytes per outgoing packet.
    pub packet_size: usize,
    pub checksum_type: ChecksumType,
    pub bytes_per_checksum: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    /// Concurrent COPY/REPLACE/TRANSFER streams.
    pub max_concurrent_moves: u32,
    /// Replication bandwidth cap in bytes per second. 0 = unlimited.
    pub bandwidth_per_sec: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub block_token_enabled: bool,
    /// Hex-encoded 32-byte token key. Empty = generated at startup.
    pub block_token_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeltaConfig {
    /// Fixed chunk size for weak/strong matching.
    pub chunk_size: u64,
    /// Checksum unit of a block rebuilt by UPDATE_BLOCK.
    pub reassembly_bytes_per_checksum: u32,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            data_dir: data_dir().join("blocks"),
            listen_addr: "0.0.0.0:9866".into(),
            xfer_addr: String::new(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            socket_timeout_ms: 60_000,
            socket_write_timeout_ms: 480_000,
            keepalive_timeout_ms: 4_000,
            read_timeout_extension_ms: 5_000,
            write_timeout_extension_ms: 5_000,
            block_size: 128 * 1024 * 1024,
            estimate_block_size: 128 * 1024 * 1024,
            packet_size: 64 * 1024,
            checksum_type: ChecksumType::Crc32c,
            bytes_per_checksum: 512,
        }
    }
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_moves: 5,
            bandwidth_per_sec: 1024 * 1024,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            block_token_enabled: false,
            block_token_key: String::new(),
        }
    }
}

impl Default for DeltaConfig {
    fn default() -> Self {
        Self {
            chunk_size: 10 * 1024 * 1024,
            reassembly_bytes_per_checksum: 1024,
        }
    }
}

impl TransferConfig {
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_write_timeout_ms)
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_millis(self.keepalive_timeout_ms)
    }

    /// Read timeout toward a mirror with `downstream` nodes behind it.
    pub fn mirror_read_timeout(&self, downstream: usize) -> Duration {
        Duration::from_millis(
            self.socket_timeout_ms + self.read_timeout_extension_ms * downstream as u64,
        )
    }

    pub fn mirror_write_timeout(&self, downstream: usize) -> Duration {
        Duration::from_millis(
            self.socket_write_timeout_ms + self.write_timeout_extension_ms * downstream as u64,
        )
    }

    /// Checksum spec for replicas this node creates.
    pub fn checksum(&self) -> ChecksumSpec {
        ChecksumSpec::new(self.checksum_type, self.bytes_per_checksum)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("basalt")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("basalt")
}

fn dirs_or_home() -> PathBuf {
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
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl NodeConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            NodeConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject sizes that would divide by zero or never advance a stream.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sizes = [
            ("transfer.packet_size", self.transfer.packet_size as u64),
            ("transfer.bytes_per_checksum", self.transfer.bytes_per_checksum as u64),
            ("delta.chunk_size", self.delta.chunk_size),
            ("delta.reassembly_bytes_per_checksum", self.delta.reassembly_bytes_per_checksum as u64),
        ];
        match sizes.iter().find(|(_, v)| *v == 0) {
            Some((name, _)) => Err(ConfigError::Invalid(format!("{name} must be greater than zero"))),
            None => Ok(()),
        }
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("BASALT_CONFIG")
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
            let text = toml::to_string_pretty(&NodeConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply BASALT_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("BASALT_NODE__DATA_DIR") {
            self.node.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("BASALT_NODE__LISTEN_ADDR") {
            self.node.listen_addr = v;
        }
        if let Some(v) = lookup("BASALT_NODE__XFER_ADDR") {
            self.node.xfer_addr = v;
        }
        if let Some(v) = lookup("BASALT_SECURITY__BLOCK_TOKEN_ENABLED") {
            self.security.block_token_enabled = v == "true" || v == "1";
        }
        if let Some(v) = lookup("BASALT_BALANCER__MAX_CONCURRENT_MOVES") {
            if let Ok(n) = v.parse() {
                self.balancer.max_concurrent_moves = n;
            }
        }
    }
}
