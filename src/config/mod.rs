//! Configuration loading and validation
//!
//! Configuration comes from a single TOML file, is deserialized with
//! serde, validated after parsing, and hashed so a run can be associated
//! with the exact configuration it ran under.

use crate::peer::{PeerAddrInfo, PeerId};
use crate::ConfigError;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Result type alias for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Top-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub crawl: CrawlConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub output: OutputConfig,

    /// The peers every run starts from
    #[serde(default)]
    pub bootstrap: Vec<BootstrapEntry>,
}

/// Which networking backend to crawl through
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// Backend name; `"sim"` is the bundled scripted backend
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Topology file for the sim backend
    #[serde(default)]
    pub topology_path: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            topology_path: None,
        }
    }
}

fn default_backend() -> String {
    "sim".to_string()
}

/// Crawl engine settings
#[derive(Debug, Clone, Deserialize)]
pub struct CrawlConfig {
    /// Number of concurrent crawler workers
    #[serde(default = "default_crawler_count")]
    pub crawler_count: usize,

    /// Number of concurrent persister workers
    #[serde(default = "default_persister_count")]
    pub persister_count: usize,

    /// Per-dial timeout in seconds
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,

    /// Stop after this many visited peers; 0 means unlimited
    #[serde(default)]
    pub crawl_limit: u64,

    /// Persist full neighbor tables (topology edges) per visited peer
    #[serde(default)]
    pub persist_neighbors: bool,

    /// Probe peers for an exposed management API
    #[serde(default)]
    pub check_exposed: bool,

    /// Seed the run with up to this many previously dialable peers from
    /// storage, in addition to the bootstrap set; 0 disables
    #[serde(default)]
    pub cached_peer_limit: usize,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            crawler_count: default_crawler_count(),
            persister_count: default_persister_count(),
            dial_timeout_secs: default_dial_timeout_secs(),
            crawl_limit: 0,
            persist_neighbors: false,
            check_exposed: false,
            cached_peer_limit: 0,
        }
    }
}

impl CrawlConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}

fn default_crawler_count() -> usize {
    16
}

fn default_persister_count() -> usize {
    4
}

fn default_dial_timeout_secs() -> u64 {
    60
}

/// Monitor (liveness probing) settings
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Number of concurrent dialer workers
    #[serde(default = "default_dialer_count")]
    pub dialer_count: usize,

    /// Per-dial timeout in seconds
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,

    /// How many known peers to probe per round
    #[serde(default = "default_probe_limit")]
    pub probe_limit: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            dialer_count: default_dialer_count(),
            dial_timeout_secs: default_dial_timeout_secs(),
            probe_limit: default_probe_limit(),
        }
    }
}

impl MonitorConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}

fn default_dialer_count() -> usize {
    16
}

fn default_probe_limit() -> usize {
    1000
}

/// Output settings
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

fn default_database_path() -> String {
    "kadmap.db".to_string()
}

/// A bootstrap peer
///
/// Either a raw hex `peer_id` or, for the sim backend, a topology `name`
/// the identity is derived from. Addresses may be omitted for sim peers;
/// they are then resolved from the topology file.
#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapEntry {
    #[serde(default)]
    pub peer_id: Option<String>,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub addrs: Vec<String>,
}

impl BootstrapEntry {
    /// Resolves this entry into a [`PeerAddrInfo`]
    pub fn to_addr_info(&self) -> ConfigResult<PeerAddrInfo> {
        let peer_id = match (&self.peer_id, &self.name) {
            (Some(hex), _) => PeerId::from_hex(hex)
                .ok_or_else(|| ConfigError::Validation(format!("invalid peer ID: {hex}")))?,
            (None, Some(name)) => PeerId::from_seed(name),
            (None, None) => {
                return Err(ConfigError::Validation(
                    "bootstrap entry needs a peer_id or a name".to_string(),
                ))
            }
        };

        let mut addrs = Vec::with_capacity(self.addrs.len());
        for addr in &self.addrs {
            let parsed: SocketAddr = addr.parse().map_err(|_| {
                ConfigError::Validation(format!("invalid bootstrap address: {addr}"))
            })?;
            addrs.push(parsed);
        }
        Ok(PeerAddrInfo::new(peer_id, addrs))
    }
}

impl Config {
    /// Validates the parsed configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.crawl.crawler_count == 0 {
            return Err(ConfigError::Validation(
                "crawl.crawler_count must be at least 1".to_string(),
            ));
        }
        if self.crawl.persister_count == 0 {
            return Err(ConfigError::Validation(
                "crawl.persister_count must be at least 1".to_string(),
            ));
        }
        if self.crawl.dial_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "crawl.dial_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.monitor.dialer_count == 0 {
            return Err(ConfigError::Validation(
                "monitor.dialer_count must be at least 1".to_string(),
            ));
        }
        if self.bootstrap.is_empty() && self.crawl.cached_peer_limit == 0 {
            return Err(ConfigError::Validation(
                "no bootstrap peers configured and cached_peer_limit is 0".to_string(),
            ));
        }
        match self.network.backend.as_str() {
            "sim" => {
                if self.network.topology_path.is_none() {
                    return Err(ConfigError::Validation(
                        "network.topology_path is required for the sim backend".to_string(),
                    ));
                }
            }
            other => {
                return Err(ConfigError::Validation(format!(
                    "unknown network backend: {other}"
                )));
            }
        }
        // Surface broken bootstrap entries at load time, not mid-run.
        for entry in &self.bootstrap {
            entry.to_addr_info()?;
        }
        Ok(())
    }

    /// Resolves the configured bootstrap peers
    pub fn bootstrap_peers(&self) -> ConfigResult<Vec<PeerAddrInfo>> {
        self.bootstrap.iter().map(|e| e.to_addr_info()).collect()
    }
}

/// Loads, validates and hashes a configuration file
///
/// Returns the configuration together with the SHA-256 hex digest of the
/// raw file contents.
pub fn load_config_with_hash(path: &Path) -> ConfigResult<(Config, String)> {
    let raw = std::fs::read_to_string(path)?;
    let hash = hex::encode(Sha256::digest(raw.as_bytes()));

    let config: Config = toml::from_str(&raw)?;
    config.validate()?;
    Ok((config, hash))
}
