//! Kadmap: a Kademlia DHT topology crawler
//!
//! Kadmap discovers the membership of a peer-to-peer DHT by recursively
//! visiting peers starting from a bootstrap set. For every peer it records
//! reachability, the advertised agent version and protocols, and the
//! neighbors the peer reports, then persists the results for offline
//! analysis. A monitor mode revisits known peers to track liveness over
//! time.

pub mod config;
pub mod crawl;
pub mod metrics;
pub mod monitor;
pub mod net;
pub mod output;
pub mod peer;
pub mod queue;
pub mod service;
pub mod storage;

use thiserror::Error;

/// Main error type for kadmap operations
#[derive(Debug, Error)]
pub enum KadmapError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Topology error: {0}")]
    Topology(#[from] net::sim::SimTopologyError),

    #[error("Network backend error: {0}")]
    Network(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Result type alias for kadmap operations
pub type Result<T> = std::result::Result<T, KadmapError>;

// Re-export commonly used types
pub use config::{load_config_with_hash, Config};
pub use crawl::{CrawlSummary, VisitResult};
pub use net::{DialError, Network};
pub use peer::{PeerAddrInfo, PeerId};
pub use storage::RunState;
