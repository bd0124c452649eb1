//! Core types for opsync

use serde::{Deserialize, Serialize};

/// Monotonic per-object version number
pub type Version = u32;

/// Identifier of a peer in the keyspace
///
/// Derived from the node's signing public key, so a node cannot pick where
/// it lands in the keyspace.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct NodeId(pub u64);

impl NodeId {
    /// Width of a node id on the wire
    pub const SIZE: usize = 8;

    /// Derive the node id for a 32-byte signing public key.
    ///
    /// First eight bytes of BLAKE3(key), little-endian.
    pub fn from_public_key(key: &[u8; 32]) -> Self {
        let hash = blake3::hash(key);
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&hash.as_bytes()[..8]);
        Self(u64::from_le_bytes(bytes))
    }

    /// XOR distance to another id
    pub fn distance(&self, other: NodeId) -> u64 {
        self.0 ^ other.0
    }

    pub fn to_le_bytes(&self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    pub fn from_le_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_le_bytes(bytes))
    }

    /// Parse from the hex form produced by `Display`
    pub fn from_hex(s: &str) -> Option<Self> {
        u64::from_str_radix(s.trim(), 16).ok().map(Self)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Demultiplexing key identifying which feature an object or request belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceTag(pub u32);

impl ServiceTag {
    /// Routing-only searches: answered with closer contacts, never results
    pub const ROUTING: ServiceTag = ServiceTag(0);
    pub const MAIL: ServiceTag = ServiceTag(2);
    pub const BOARD: ServiceTag = ServiceTag(3);
    pub const SCHEDULE: ServiceTag = ServiceTag(5);
}

impl std::fmt::Display for ServiceTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            ServiceTag::ROUTING => write!(f, "routing"),
            ServiceTag::MAIL => write!(f, "mail"),
            ServiceTag::BOARD => write!(f, "board"),
            ServiceTag::SCHEDULE => write!(f, "schedule"),
            ServiceTag(other) => write!(f, "service-{}", other),
        }
    }
}

/// Service-defined object key, stable across versions of the same object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey(pub Vec<u8>);

impl ObjectKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

/// Reference to a payload file living outside the signed header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PayloadRef {
    /// BLAKE3 hash of the encrypted payload file
    pub hash: [u8; 32],
    /// Size of the encrypted payload file in bytes
    pub size: u64,
}

impl PayloadRef {
    pub fn new(hash: [u8; 32], size: u64) -> Self {
        Self { hash, size }
    }
}

/// Description of a file handed to the transfer collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDetails {
    pub service: ServiceTag,
    pub hash: [u8; 32],
    pub size: u64,
    /// Service-specific lookup bytes (the object key)
    pub extra: Vec<u8>,
}

/// Current Unix time in milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_from_public_key_is_stable() {
        let key = [7u8; 32];
        assert_eq!(NodeId::from_public_key(&key), NodeId::from_public_key(&key));
        assert_ne!(
            NodeId::from_public_key(&key),
            NodeId::from_public_key(&[8u8; 32])
        );
    }

    #[test]
    fn test_node_id_hex_roundtrip() {
        let id = NodeId(0x00ab_cdef_0123_4567);
        let text = id.to_string();
        assert_eq!(text.len(), 16);
        assert_eq!(NodeId::from_hex(&text), Some(id));
    }

    #[test]
    fn test_distance_is_xor() {
        assert_eq!(NodeId(10).distance(NodeId(12)), 6);
        assert_eq!(NodeId(12).distance(NodeId(10)), 6);
        assert_eq!(NodeId(5).distance(NodeId(5)), 0);
    }

    #[test]
    fn test_service_tag_display() {
        assert_eq!(ServiceTag::BOARD.to_string(), "board");
        assert_eq!(ServiceTag(99).to_string(), "service-99");
    }
}
