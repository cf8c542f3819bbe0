//! Networking stack interface
//!
//! The crawler core does not implement a DHT protocol itself. It consumes
//! an existing peer-to-peer stack through the [`Network`] trait: connect to
//! a peer, read back what the peer advertised about itself, ask it for the
//! closest peers to a target identity, and release the connection again.
//!
//! [`sim`] provides the crate's bundled implementation, a scripted
//! in-memory network used by the integration tests and offline runs. Real
//! stacks plug in behind the same trait.

pub mod api;
pub mod sim;

use crate::peer::{PeerAddrInfo, PeerId};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Classified connection-attempt failures
///
/// The variants mirror what a dial against a DHT peer actually produces in
/// the wild; [`DialError::kind`] yields the stable key used in frequency
/// tables and database rows.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DialError {
    #[error("no public IP address")]
    NoPublicAddress,

    #[error("dial timed out")]
    DialTimeout,

    #[error("peer ID mismatch")]
    PeerIdMismatch,

    #[error("connection refused")]
    ConnectionRefused,

    #[error("max dial attempts exceeded")]
    MaxDialAttemptsExceeded,

    #[error("{0}")]
    Unknown(String),
}

impl DialError {
    /// The stable snake_case key for this error kind
    pub fn kind(&self) -> &'static str {
        match self {
            DialError::NoPublicAddress => "no_public_address",
            DialError::DialTimeout => "dial_timeout",
            DialError::PeerIdMismatch => "peer_id_mismatch",
            DialError::ConnectionRefused => "connection_refused",
            DialError::MaxDialAttemptsExceeded => "max_dial_attempts_exceeded",
            DialError::Unknown(_) => "unknown",
        }
    }
}

/// Errors from post-connect operations (queries, disconnects)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    #[error("peer is not connected")]
    NotConnected,

    #[error("query failed: {0}")]
    Query(String),

    #[error("{0}")]
    Other(String),
}

/// What a connected peer advertised about itself
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    /// The agent/client version string, e.g. `go-ipfs/0.12.1`
    pub agent_version: Option<String>,

    /// Protocol identifiers the peer speaks
    pub protocols: Vec<String>,
}

/// The consumed peer-to-peer networking stack
///
/// Implementations are shared read-mostly across every crawler and dialer
/// of a run and must be safe for concurrent use.
#[async_trait]
pub trait Network: Send + Sync {
    /// Establishes a connection to the given peer within `timeout`
    async fn connect(&self, peer: &PeerAddrInfo, timeout: Duration) -> Result<(), DialError>;

    /// Reads back the identity a connected peer advertised
    ///
    /// Returns `None` for peers that were never connected.
    fn identify(&self, peer: &PeerId) -> Option<Identity>;

    /// Asks a connected peer for the closest peers it knows to `target`
    async fn find_closest_peers(
        &self,
        peer: &PeerId,
        target: &PeerId,
    ) -> Result<Vec<PeerAddrInfo>, NetworkError>;

    /// Releases the connection to a peer
    ///
    /// Callers treat failures as non-fatal; the connection is gone either
    /// way.
    async fn disconnect(&self, peer: &PeerId) -> Result<(), NetworkError>;
}
