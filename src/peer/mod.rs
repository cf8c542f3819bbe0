//! Peer identity and addressing
//!
//! This module defines the Kademlia identity space used by the crawler:
//! - 256-bit peer identifiers with XOR-metric helpers
//! - synthetic target identifiers with a chosen common prefix length,
//!   used to sweep different regions of a remote routing table
//! - peer address records with public/private address classification

use rand::Rng;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Number of bits in a peer identifier
pub const ID_BITS: u32 = 256;

/// A 256-bit peer identifier in the Kademlia XOR space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// Creates a peer ID from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derives a peer ID by hashing an arbitrary seed string
    ///
    /// This is how the simulated network backend maps human-readable
    /// peer names onto the identity space.
    pub fn from_seed(seed: &str) -> Self {
        let digest = Sha256::digest(seed.as_bytes());
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Generates a uniformly random peer ID
    pub fn random(rng: &mut impl Rng) -> Self {
        let mut bytes = [0u8; 32];
        rng.fill(&mut bytes[..]);
        Self(bytes)
    }

    /// Parses a peer ID from its 64-character hex form
    pub fn from_hex(s: &str) -> Option<Self> {
        let raw = hex::decode(s).ok()?;
        let bytes: [u8; 32] = raw.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Returns the raw identifier bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Returns the number of leading bits this ID shares with `other`
    ///
    /// Ranges from 0 (first bits differ) to [`ID_BITS`] (identical IDs).
    pub fn common_prefix_len(&self, other: &PeerId) -> u32 {
        let mut cpl = 0;
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            let diff = a ^ b;
            if diff == 0 {
                cpl += 8;
            } else {
                cpl += diff.leading_zeros();
                break;
            }
        }
        cpl
    }

    /// Synthesizes an ID sharing exactly `cpl` leading bits with `self`
    ///
    /// The first `cpl` bits are copied from `self`, bit `cpl` is flipped,
    /// and the remainder is random. Queries for targets built this way
    /// bias a remote peer's "closest peers" lookup towards routing table
    /// buckets at increasing depth.
    ///
    /// # Panics
    ///
    /// Panics if `cpl >= ID_BITS` — an exact-prefix target cannot share
    /// all bits.
    pub fn with_common_prefix_len(&self, cpl: u32, rng: &mut impl Rng) -> PeerId {
        assert!(cpl < ID_BITS, "common prefix length out of range: {cpl}");

        let mut bytes = [0u8; 32];
        rng.fill(&mut bytes[..]);

        let idx = (cpl / 8) as usize;
        let rem = cpl % 8;

        // Copy whole prefix bytes, then the leading bits of the split byte.
        bytes[..idx].copy_from_slice(&self.0[..idx]);
        let mask = if rem == 0 { 0u8 } else { 0xffu8 << (8 - rem) };
        bytes[idx] = (self.0[idx] & mask) | (bytes[idx] & !mask);

        // Force bit `cpl` to differ so the prefix length is exact.
        let bit = 0x80u8 >> rem;
        bytes[idx] = (bytes[idx] & !bit) | (!self.0[idx] & bit);

        PeerId(bytes)
    }

    /// Short hex form for log output
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let raw = hex::decode(&s).map_err(DeError::custom)?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| DeError::custom("peer ID must be 32 bytes"))?;
        Ok(PeerId(bytes))
    }
}

/// A peer identity together with its known network addresses
///
/// Immutable once constructed for a given visit. Use [`PeerAddrInfo::public`]
/// to strip addresses a crawler on the open internet cannot reach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddrInfo {
    pub peer_id: PeerId,
    pub addrs: Vec<SocketAddr>,
}

impl PeerAddrInfo {
    pub fn new(peer_id: PeerId, addrs: Vec<SocketAddr>) -> Self {
        Self { peer_id, addrs }
    }

    /// Returns a copy with only publicly reachable addresses retained
    pub fn public(&self) -> PeerAddrInfo {
        PeerAddrInfo {
            peer_id: self.peer_id,
            addrs: self
                .addrs
                .iter()
                .copied()
                .filter(|a| is_public_addr(a))
                .collect(),
        }
    }

    /// Returns the distinct IP addresses of this peer, in first-seen order
    ///
    /// A peer usually advertises the same IP several times (one socket
    /// address per transport), so probes that operate per-IP deduplicate
    /// through this.
    pub fn distinct_ips(&self) -> Vec<IpAddr> {
        let mut ips = Vec::new();
        for addr in &self.addrs {
            if !ips.contains(&addr.ip()) {
                ips.push(addr.ip());
            }
        }
        ips
    }
}

/// Classifies whether an address is reachable from the open internet
///
/// Loopback, RFC 1918 private ranges, link-local, unspecified and IPv6
/// unique-local addresses are all considered unreachable.
pub fn is_public_addr(addr: &SocketAddr) -> bool {
    match addr.ip() {
        IpAddr::V4(ip) => {
            !(ip.is_loopback()
                || ip.is_private()
                || ip.is_link_local()
                || ip.is_unspecified()
                || ip.is_broadcast()
                || ip.is_documentation())
        }
        IpAddr::V6(ip) => {
            // fc00::/7 unique local, fe80::/10 link local
            let seg = ip.segments();
            !(ip.is_loopback()
                || ip.is_unspecified()
                || (seg[0] & 0xfe00) == 0xfc00
                || (seg[0] & 0xffc0) == 0xfe80)
        }
    }
}
