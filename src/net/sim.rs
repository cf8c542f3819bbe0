//! Scripted in-memory network backend
//!
//! `SimNetwork` implements [`Network`](super::Network) over a fixed
//! topology description: peers with addresses, neighbor lists, advertised
//! identities, artificial connect latency and scripted failures. The
//! integration tests drive the full crawl pipeline against it, and the
//! `crawl` command can run against a topology file (`backend = "sim"`)
//! for offline experiments.

use crate::net::{DialError, Identity, Network, NetworkError};
use crate::peer::{PeerAddrInfo, PeerId};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

/// One peer in a simulated topology
#[derive(Debug, Clone)]
struct SimPeer {
    info: PeerAddrInfo,
    agent_version: Option<String>,
    protocols: Vec<String>,
    neighbors: Vec<PeerId>,
    /// Outcome per connect attempt; the last entry repeats. `None` means
    /// the attempt succeeds.
    connect_script: Vec<Option<DialError>>,
    fail_discovery: bool,
    latency: Duration,
}

/// Declarative description of a simulated peer
///
/// ```
/// use kadmap::net::sim::SimPeerSpec;
///
/// let spec = SimPeerSpec::named("seed-1")
///     .addrs(["1.0.0.1:4001"])
///     .agent("go-ipfs/0.12.1")
///     .protocols(["/ipfs/kad/1.0.0"])
///     .neighbors(["seed-2", "seed-3"]);
/// ```
#[derive(Debug, Clone)]
pub struct SimPeerSpec {
    name: String,
    addrs: Vec<SocketAddr>,
    agent_version: Option<String>,
    protocols: Vec<String>,
    neighbors: Vec<String>,
    connect_script: Vec<Option<DialError>>,
    fail_discovery: bool,
    latency: Duration,
}

impl SimPeerSpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addrs: Vec::new(),
            agent_version: None,
            protocols: Vec::new(),
            neighbors: Vec::new(),
            connect_script: vec![None],
            fail_discovery: false,
            latency: Duration::ZERO,
        }
    }

    pub fn addrs<I, S>(mut self, addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.addrs = addrs
            .into_iter()
            .map(|a| a.as_ref().parse().expect("invalid socket address"))
            .collect();
        self
    }

    pub fn agent(mut self, agent: impl Into<String>) -> Self {
        self.agent_version = Some(agent.into());
        self
    }

    pub fn protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    pub fn neighbors<I, S>(mut self, neighbors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.neighbors = neighbors.into_iter().map(Into::into).collect();
        self
    }

    /// Scripts the outcome of successive connect attempts
    ///
    /// The last entry repeats for further attempts.
    pub fn connect_script<I>(mut self, script: I) -> Self
    where
        I: IntoIterator<Item = Option<DialError>>,
    {
        self.connect_script = script.into_iter().collect();
        if self.connect_script.is_empty() {
            self.connect_script.push(None);
        }
        self
    }

    /// Makes every connect attempt fail with the given error
    pub fn connect_error(self, err: DialError) -> Self {
        self.connect_script([Some(err)])
    }

    /// Makes every neighbor query against this peer fail
    pub fn fail_discovery(mut self) -> Self {
        self.fail_discovery = true;
        self
    }

    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

/// Builder assembling a [`SimNetwork`] from peer specs
#[derive(Debug, Default)]
pub struct SimNetworkBuilder {
    specs: Vec<SimPeerSpec>,
}

impl SimNetworkBuilder {
    pub fn add(mut self, spec: SimPeerSpec) -> Self {
        self.specs.push(spec);
        self
    }

    pub fn build(self) -> SimNetwork {
        let mut peers = HashMap::new();
        for spec in &self.specs {
            let id = PeerId::from_seed(&spec.name);
            peers.insert(
                id,
                SimPeer {
                    info: PeerAddrInfo::new(id, spec.addrs.clone()),
                    agent_version: spec.agent_version.clone(),
                    protocols: spec.protocols.clone(),
                    neighbors: spec
                        .neighbors
                        .iter()
                        .map(|n| PeerId::from_seed(n))
                        .collect(),
                    connect_script: spec.connect_script.clone(),
                    fail_discovery: spec.fail_discovery,
                    latency: spec.latency,
                },
            );
        }
        SimNetwork {
            peers,
            connected: Mutex::new(HashSet::new()),
            attempts: Mutex::new(HashMap::new()),
        }
    }
}

/// A scripted in-memory [`Network`] implementation
pub struct SimNetwork {
    peers: HashMap<PeerId, SimPeer>,
    connected: Mutex<HashSet<PeerId>>,
    attempts: Mutex<HashMap<PeerId, u32>>,
}

impl SimNetwork {
    pub fn builder() -> SimNetworkBuilder {
        SimNetworkBuilder::default()
    }

    /// Loads a topology description from a TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, SimTopologyError> {
        let raw = std::fs::read_to_string(path)?;
        let topology: SimTopology = toml::from_str(&raw)?;

        let mut builder = Self::builder();
        for peer in topology.peers {
            // Surface bad addresses as errors; the builder itself is a
            // test helper and panics on them.
            for addr in &peer.addrs {
                if addr.parse::<SocketAddr>().is_err() {
                    return Err(SimTopologyError::InvalidAddress {
                        peer: peer.name.clone(),
                        addr: addr.clone(),
                    });
                }
            }
            let mut spec = SimPeerSpec::named(peer.name.as_str())
                .addrs(&peer.addrs)
                .protocols(peer.protocols)
                .neighbors(peer.neighbors)
                .latency(Duration::from_millis(peer.latency_ms));
            if let Some(agent) = peer.agent {
                spec = spec.agent(agent);
            }
            if let Some(kind) = &peer.connect_error {
                spec = spec.connect_error(dial_error_from_kind(kind)?);
            }
            if peer.fail_discovery {
                spec = spec.fail_discovery();
            }
            builder = builder.add(spec);
        }
        Ok(builder.build())
    }

    /// The peer ID a topology name maps to
    pub fn id_of(name: &str) -> PeerId {
        PeerId::from_seed(name)
    }

    /// The address info of a named peer, for seeding bootstrap sets
    pub fn addr_info_of(&self, name: &str) -> Option<PeerAddrInfo> {
        self.peers.get(&Self::id_of(name)).map(|p| p.info.clone())
    }

    /// Number of peers in the topology
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Number of connect attempts made against a peer so far
    pub fn connect_attempts(&self, peer: &PeerId) -> u32 {
        self.attempts
            .lock()
            .unwrap()
            .get(peer)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Network for SimNetwork {
    async fn connect(&self, peer: &PeerAddrInfo, timeout: Duration) -> Result<(), DialError> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let count = attempts.entry(peer.peer_id).or_insert(0);
            let current = *count;
            *count += 1;
            current as usize
        };

        let scripted = match self.peers.get(&peer.peer_id) {
            Some(sim) => {
                if sim.latency >= timeout {
                    tokio::time::sleep(timeout).await;
                    return Err(DialError::DialTimeout);
                }
                tokio::time::sleep(sim.latency).await;
                let idx = attempt.min(sim.connect_script.len() - 1);
                sim.connect_script[idx].clone()
            }
            // A peer that exists only as someone's routing table entry.
            None => Some(DialError::DialTimeout),
        };

        match scripted {
            Some(err) => Err(err),
            None => {
                self.connected.lock().unwrap().insert(peer.peer_id);
                Ok(())
            }
        }
    }

    fn identify(&self, peer: &PeerId) -> Option<Identity> {
        if !self.connected.lock().unwrap().contains(peer) {
            return None;
        }
        self.peers.get(peer).map(|sim| Identity {
            agent_version: sim.agent_version.clone(),
            protocols: sim.protocols.clone(),
        })
    }

    async fn find_closest_peers(
        &self,
        peer: &PeerId,
        target: &PeerId,
    ) -> Result<Vec<PeerAddrInfo>, NetworkError> {
        if !self.connected.lock().unwrap().contains(peer) {
            return Err(NetworkError::NotConnected);
        }
        let sim = self
            .peers
            .get(peer)
            .ok_or(NetworkError::NotConnected)?;
        if sim.fail_discovery {
            return Err(NetworkError::Query("routing table unavailable".into()));
        }

        // Return the neighbors nearest to the target in XOR distance, the
        // way a remote routing-table lookup would.
        let mut neighbors = sim.neighbors.clone();
        neighbors.sort_by_key(|n| xor_distance(n, target));
        neighbors.truncate(20);

        Ok(neighbors
            .into_iter()
            .map(|id| match self.peers.get(&id) {
                Some(known) => known.info.clone(),
                // Advertised but unknown to the simulation: a routing
                // table entry with no reachable addresses.
                None => PeerAddrInfo::new(id, Vec::new()),
            })
            .collect())
    }

    async fn disconnect(&self, peer: &PeerId) -> Result<(), NetworkError> {
        self.connected.lock().unwrap().remove(peer);
        Ok(())
    }
}

fn xor_distance(a: &PeerId, b: &PeerId) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (i, (x, y)) in a.as_bytes().iter().zip(b.as_bytes().iter()).enumerate() {
        out[i] = x ^ y;
    }
    out
}

fn dial_error_from_kind(kind: &str) -> Result<DialError, SimTopologyError> {
    let err = match kind {
        "no_public_address" => DialError::NoPublicAddress,
        "dial_timeout" => DialError::DialTimeout,
        "peer_id_mismatch" => DialError::PeerIdMismatch,
        "connection_refused" => DialError::ConnectionRefused,
        "max_dial_attempts_exceeded" => DialError::MaxDialAttemptsExceeded,
        other => return Err(SimTopologyError::UnknownErrorKind(other.to_string())),
    };
    Ok(err)
}

/// TOML shape of a topology file
#[derive(Debug, Deserialize)]
struct SimTopology {
    #[serde(default)]
    peers: Vec<SimTopologyPeer>,
}

#[derive(Debug, Deserialize)]
struct SimTopologyPeer {
    name: String,
    #[serde(default)]
    addrs: Vec<String>,
    #[serde(default)]
    agent: Option<String>,
    #[serde(default)]
    protocols: Vec<String>,
    #[serde(default)]
    neighbors: Vec<String>,
    #[serde(default)]
    connect_error: Option<String>,
    #[serde(default)]
    fail_discovery: bool,
    #[serde(default)]
    latency_ms: u64,
}

/// Errors loading a topology file
#[derive(Debug, thiserror::Error)]
pub enum SimTopologyError {
    #[error("failed to read topology file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse topology file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("unknown connect error kind: {0}")]
    UnknownErrorKind(String),

    #[error("invalid address {addr} for peer {peer}")]
    InvalidAddress { peer: String, addr: String },
}
