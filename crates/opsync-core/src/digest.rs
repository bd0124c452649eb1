//! Patch digests: compact `{owner, key, version}` records without payloads.
//!
//! ```text
//! ┌──────────────┬──────────────────────┬──────────────┐
//! │ owner  8B LE │ key  (service width) │ version 4B LE│  × n
//! └──────────────┴──────────────────────┴──────────────┘
//! ```
//!
//! A digest whose length is not a whole number of entries is dropped
//! wholesale; no partial decode.

use crate::error::{OpError, OpResult};
use crate::types::{NodeId, ObjectKey, Version};

/// One digest record
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PatchEntry {
    pub owner: NodeId,
    pub key: ObjectKey,
    pub version: Version,
}

impl PatchEntry {
    pub fn new(owner: NodeId, key: ObjectKey, version: Version) -> Self {
        Self {
            owner,
            key,
            version,
        }
    }
}

/// Encoded size of one entry for a service with `key_width`-byte keys
pub const fn entry_size(key_width: usize) -> usize {
    NodeId::SIZE + key_width + 4
}

pub fn encode(entries: &[PatchEntry], key_width: usize) -> OpResult<Vec<u8>> {
    let mut out = Vec::with_capacity(entries.len() * entry_size(key_width));
    for entry in entries {
        if entry.key.len() != key_width {
            return Err(OpError::MalformedPacket(format!(
                "digest key is {} bytes, service uses {}",
                entry.key.len(),
                key_width
            )));
        }
        out.extend_from_slice(&entry.owner.to_le_bytes());
        out.extend_from_slice(entry.key.as_bytes());
        out.extend_from_slice(&entry.version.to_le_bytes());
    }
    Ok(out)
}

pub fn decode(bytes: &[u8], key_width: usize) -> OpResult<Vec<PatchEntry>> {
    let size = entry_size(key_width);
    if bytes.len() % size != 0 {
        return Err(OpError::MalformedDigest {
            len: bytes.len(),
            entry_size: size,
        });
    }
    let entries = bytes
        .chunks_exact(size)
        .map(|chunk| {
            let mut owner = [0u8; 8];
            owner.copy_from_slice(&chunk[..8]);
            let key = chunk[8..8 + key_width].to_vec();
            let mut version = [0u8; 4];
            version.copy_from_slice(&chunk[8 + key_width..]);
            PatchEntry {
                owner: NodeId::from_le_bytes(owner),
                key: ObjectKey(key),
                version: Version::from_le_bytes(version),
            }
        })
        .collect();
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_is_little_endian() {
        let entry = PatchEntry::new(NodeId(1), ObjectKey(vec![0xaa, 0xbb]), 2);
        let bytes = encode(&[entry], 2).unwrap();
        assert_eq!(bytes, vec![1, 0, 0, 0, 0, 0, 0, 0, 0xaa, 0xbb, 2, 0, 0, 0]);
    }

    #[test]
    fn test_decode_multiple_entries() {
        let entries = vec![
            PatchEntry::new(NodeId(7), ObjectKey(vec![1; 8]), 3),
            PatchEntry::new(NodeId(u64::MAX), ObjectKey(vec![2; 8]), u32::MAX),
        ];
        let bytes = encode(&entries, 8).unwrap();
        assert_eq!(bytes.len(), 2 * entry_size(8));
        assert_eq!(decode(&bytes, 8).unwrap(), entries);
    }

    #[test]
    fn test_ragged_digest_dropped_wholesale() {
        let entry = PatchEntry::new(NodeId(7), ObjectKey(vec![1; 8]), 3);
        let mut bytes = encode(&[entry.clone(), entry], 8).unwrap();
        bytes.pop();
        assert!(matches!(
            decode(&bytes, 8),
            Err(OpError::MalformedDigest { entry_size: 20, .. })
        ));
    }

    #[test]
    fn test_empty_digest_is_empty() {
        assert!(decode(&[], 8).unwrap().is_empty());
    }

    #[test]
    fn test_wrong_key_width_refused() {
        let entry = PatchEntry::new(NodeId(7), ObjectKey(vec![1; 3]), 3);
        assert!(encode(&[entry], 8).is_err());
    }
}
