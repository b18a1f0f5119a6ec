//! # Configuration Management
//!
//! TOML configuration for a sharenet node:
//! - the address the endpoint binds and advertises (its NodeId source)
//! - an optional sync authority and bootstrap peers
//! - network timeouts and limits (`[network]`)
//! - sync engine timing and the versioned tables (`[sync]`)
//!
//! The file lives in a platform-appropriate directory (e.g.
//! `~/.config/sharenet/config.toml` on Linux). Every key is optional and
//! falls back to its default.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::protocol::{NodeId, PeerAddress, MAX_FRAME_LEN};
use crate::storage::DEFAULT_VERSIONED_TABLES;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub data_dir: Option<PathBuf>,
    pub authority_url: Option<String>,
    pub bootstrap_peers: Vec<String>,
    pub network: NetworkConfig,
    pub sync: SyncConfig,

    #[serde(skip)]
    pub config_file_path: PathBuf,
}

/// Connection endpoint tunables.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub max_frame_len: usize,
    pub peer_timeout_secs: u64,
    pub cleanup_interval_secs: u64,
    pub request_timeout_ms: u64,
}

/// Sync engine tunables.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub interval_ms: u64,
    pub retry_backoff_ms: u64,
    pub join_timeout_ms: u64,
    pub versioned_tables: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            data_dir: None,
            authority_url: None,
            bootstrap_peers: Vec::new(),
            network: NetworkConfig::default(),
            sync: SyncConfig::default(),
            config_file_path: PathBuf::new(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            read_timeout_ms: 2_000,
            max_frame_len: MAX_FRAME_LEN,
            peer_timeout_secs: 3_600,
            cleanup_interval_secs: 60,
            request_timeout_ms: 5_000,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            retry_backoff_ms: 60_000,
            join_timeout_ms: 5_000,
            versioned_tables: DEFAULT_VERSIONED_TABLES.iter().map(|t| t.to_string()).collect(),
        }
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

impl Config {
    /// Writes a default configuration to the default location.
    pub async fn init() -> Result<Self> {
        Self::init_at(&Self::config_dir()?.join("config.toml")).await
    }

    pub async fn init_at(config_file: &Path) -> Result<Self> {
        if let Some(parent) = config_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let config = Self {
            config_file_path: config_file.to_path_buf(),
            ..Self::default()
        };
        config.save().await?;
        Ok(config)
    }

    pub async fn load() -> Result<Self> {
        Self::load_from(&Self::config_dir()?.join("config.toml")).await
    }

    pub async fn load_from(config_file: &Path) -> Result<Self> {
        if !config_file.exists() {
            anyhow::bail!(
                "sharenet not initialized: {} does not exist. Run 'sharenet init' first.",
                config_file.display()
            );
        }

        let content = tokio::fs::read_to_string(config_file).await?;
        let mut config: Config = toml::from_str(&content)?;
        config.config_file_path = config_file.to_path_buf();
        Ok(config)
    }

    pub async fn save(&self) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(&self.config_file_path, content).await?;
        Ok(())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_file_path
    }

    /// Where the version store snapshot lives: `data_dir`, or `data/` next
    /// to the config file.
    pub fn data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        self.config_file_path
            .parent()
            .map(|parent| parent.join("data"))
            .unwrap_or_else(|| PathBuf::from("data"))
    }

    pub fn address(&self) -> PeerAddress {
        PeerAddress::new(self.host.clone(), self.port)
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::from_address(&self.host, self.port)
    }

    /// Parses `bootstrap_peers`, skipping entries that are not `host:port`.
    pub fn bootstrap_addresses(&self) -> Vec<PeerAddress> {
        self.bootstrap_peers
            .iter()
            .filter_map(|entry| match entry.parse::<PeerAddress>() {
                Ok(address) => Some(address),
                Err(e) => {
                    tracing::warn!("Ignoring bootstrap peer: {}", e);
                    None
                }
            })
            .collect()
    }

    fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?
            .join("sharenet");
        Ok(config_dir)
    }
}
