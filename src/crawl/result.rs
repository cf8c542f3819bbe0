//! Per-visit result record

use crate::net::DialError;
use crate::peer::PeerAddrInfo;
use chrono::{DateTime, Duration, Utc};

/// Data gathered from visiting a single peer
///
/// Produced by exactly one crawler, consumed exactly once by the
/// scheduler, then handed read-only to the persist queue.
#[derive(Debug, Clone)]
pub struct VisitResult {
    /// The crawler that generated this result
    pub crawler_id: String,

    /// The visited peer, with only its public addresses
    pub peer: PeerAddrInfo,

    /// Neighbors reported through protocol-level discovery
    ///
    /// Only these may extend the crawl frontier. Routing-table entries
    /// obtained through the exposed management API carry no addresses and
    /// are kept separately in `api_neighbor_ids`.
    pub neighbors: Vec<PeerAddrInfo>,

    /// Neighbor identities reported by the management API, if probed
    pub api_neighbor_ids: Vec<String>,

    /// The agent version the peer advertised
    pub agent_version: Option<String>,

    /// Protocol identifiers the peer supports
    pub protocols: Vec<String>,

    /// The connection failure, if the peer could not be reached
    pub connect_error: Option<DialError>,

    /// Set when every routing-table query against the peer failed
    pub discovery_error: Option<String>,

    /// Little-endian bitmap of which CPL queries failed (bit 0 = CPL 0)
    pub error_bits: u16,

    /// Whether the peer answered on its exposed management API
    pub exposed_api: bool,

    pub connect_started_at: DateTime<Utc>,
    pub connect_ended_at: DateTime<Utc>,
    pub visit_started_at: DateTime<Utc>,
    pub visit_ended_at: DateTime<Utc>,
}

impl VisitResult {
    /// Whether the peer accepted a connection
    pub fn is_dialable(&self) -> bool {
        self.connect_error.is_none()
    }

    /// Time spent connecting to the peer
    pub fn connect_duration(&self) -> Duration {
        self.connect_ended_at - self.connect_started_at
    }

    /// Time spent on the whole visit (connecting plus discovery)
    pub fn visit_duration(&self) -> Duration {
        self.visit_ended_at - self.visit_started_at
    }
}
