//! Node configuration loaded from `<data>/opsync.toml`.
//!
//! Every field has a default, so a missing file or a partial file is fine.
//! Durations are stored in milliseconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{OpError, OpResult};

/// File name of the config file inside the data directory
pub const CONFIG_FILE: &str = "opsync.toml";

/// Largest datagram the transport will send or accept
pub const MAX_DATAGRAM_SIZE: usize = 1500;

/// Runtime configuration for a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// First UDP port to try binding
    pub port: u16,
    /// Number of consecutive ports tried before giving up
    pub bind_attempts: u16,
    /// Consecutive receive failures tolerated before the listener stops
    pub max_receive_retries: u32,
    /// Number of nearest peers that hold custody of an owner's objects (K)
    pub custody_size: usize,
    /// Owner count above which a service cache prunes itself
    pub prune_size: usize,
    /// Dirty caches are flushed this often (ms)
    pub save_interval: u64,
    /// Core maintenance tick (ms)
    pub tick_interval: u64,
    /// Searches are dropped after this long (ms)
    pub search_timeout: u64,
    /// Contacts queried in parallel per search round
    pub search_alpha: usize,
    /// Contacts silent for this long are expired (ms)
    pub contact_timeout: u64,
    /// Payload downloads with no completion after this long are forgotten (ms)
    pub download_timeout: u64,
    /// Shared network key, 64 hex characters
    pub network_key: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            port: 4970,
            bind_attempts: 5,
            max_receive_retries: 100,
            custody_size: 8,
            prune_size: 100,
            save_interval: 60_000,
            tick_interval: 1_000,
            search_timeout: 10_000,
            search_alpha: 3,
            contact_timeout: 120_000,
            download_timeout: 600_000,
            network_key: hex::encode(blake3::hash(b"opsync-default-network").as_bytes()),
        }
    }
}

impl NodeConfig {
    /// Load the config from `data_dir`, falling back to defaults if the file is absent.
    pub fn load(data_dir: impl AsRef<Path>) -> OpResult<Self> {
        let path = data_dir.as_ref().join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)?;
        let config: NodeConfig =
            toml::from_str(&text).map_err(|e| OpError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the config into `data_dir`, creating the directory if needed.
    pub fn save(&self, data_dir: impl AsRef<Path>) -> OpResult<()> {
        let dir = data_dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let text = toml::to_string_pretty(self).map_err(|e| OpError::Config(e.to_string()))?;
        std::fs::write(dir.join(CONFIG_FILE), text)?;
        Ok(())
    }

    /// Check values that would make the node misbehave.
    pub fn validate(&self) -> OpResult<()> {
        if self.custody_size == 0 {
            return Err(OpError::Config("custody_size must be at least 1".into()));
        }
        if self.prune_size < 2 {
            return Err(OpError::Config("prune_size must be at least 2".into()));
        }
        if self.search_alpha == 0 {
            return Err(OpError::Config("search_alpha must be at least 1".into()));
        }
        if self.bind_attempts == 0 {
            return Err(OpError::Config("bind_attempts must be at least 1".into()));
        }
        self.network_key_bytes()?;
        Ok(())
    }

    /// Decode the shared network key.
    pub fn network_key_bytes(&self) -> OpResult<[u8; 32]> {
        let bytes = hex::decode(self.network_key.trim())
            .map_err(|e| OpError::Config(format!("network_key is not hex: {}", e)))?;
        bytes
            .try_into()
            .map_err(|_| OpError::Config("network_key must be 32 bytes".into()))
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_millis(self.save_interval)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval.max(1))
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_millis(self.search_timeout)
    }

    pub fn contact_timeout(&self) -> Duration {
        Duration::from_millis(self.contact_timeout)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_millis(self.download_timeout)
    }
}
