//! On-disk layout of one service cache.
//!
//! ```text
//! <data>/services/<tag>/
//!   <bs58(owner ^ mask)>/            one directory per owner
//!     <keyed("headers")>             encrypted Vec<SignedData bytes>
//!     <keyed(owner, key, hash)>      payload files, encrypted per object
//! ```
//!
//! The mask is derived from the node-local file key, so directory names
//! reveal nothing to other users of the disk but decode back to owner ids
//! at startup.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::crypto::keyed_name;
use crate::error::OpResult;
use crate::types::{NodeId, ObjectKey, PayloadRef};
use crate::versioned::file;

/// Paths for one service's files
#[derive(Debug, Clone)]
pub struct CacheDisk {
    root: PathBuf,
    file_key: [u8; 32],
    mask: u64,
}

impl CacheDisk {
    pub fn new(root: impl Into<PathBuf>, file_key: [u8; 32]) -> Self {
        let mut mask = [0u8; 8];
        mask.copy_from_slice(&blake3::keyed_hash(&file_key, b"owner-mask").as_bytes()[..8]);
        Self {
            root: root.into(),
            file_key,
            mask: u64::from_le_bytes(mask),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn owner_name(&self, owner: NodeId) -> String {
        bs58::encode((owner.0 ^ self.mask).to_le_bytes()).into_string()
    }

    fn decode_owner(&self, name: &str) -> Option<NodeId> {
        let bytes = bs58::decode(name).into_vec().ok()?;
        let bytes: [u8; 8] = bytes.try_into().ok()?;
        Some(NodeId(u64::from_le_bytes(bytes) ^ self.mask))
    }

    pub fn owner_dir(&self, owner: NodeId) -> PathBuf {
        self.root.join(self.owner_name(owner))
    }

    pub fn headers_path(&self, owner: NodeId) -> PathBuf {
        self.owner_dir(owner)
            .join(keyed_name(&self.file_key, &[b"headers"]))
    }

    pub fn payload_path(&self, owner: NodeId, key: &ObjectKey, payload: &PayloadRef) -> PathBuf {
        self.owner_dir(owner).join(keyed_name(
            &self.file_key,
            &[&owner.to_le_bytes(), key.as_bytes(), &payload.hash],
        ))
    }

    /// Owners with a directory on disk
    pub fn stored_owners(&self) -> OpResult<Vec<NodeId>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut owners = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            match name.to_str().and_then(|n| self.decode_owner(n)) {
                Some(owner) => owners.push(owner),
                None => debug!(name = ?name, "skipping foreign directory in cache root"),
            }
        }
        Ok(owners)
    }

    /// Write an owner's signed headers, replacing what was there.
    pub fn save_owner(&self, owner: NodeId, headers: &[Vec<u8>]) -> OpResult<()> {
        file::save_headers(&self.headers_path(owner), &self.file_key, headers)
    }

    pub fn load_owner(&self, owner: NodeId) -> OpResult<Vec<Vec<u8>>> {
        file::load_headers(&self.headers_path(owner), &self.file_key)
    }

    /// Delete an owner's directory with everything in it.
    pub fn remove_owner(&self, owner: NodeId) {
        let dir = self.owner_dir(owner);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => debug!(%owner, "removed owner directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(%owner, error = %e, "failed to remove owner directory"),
        }
    }

    /// Delete one payload file; returns true if a file was removed.
    pub fn remove_payload(&self, owner: NodeId, key: &ObjectKey, payload: &PayloadRef) -> bool {
        let path = self.payload_path(owner, key, payload);
        match std::fs::remove_file(&path) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                warn!(%owner, error = %e, "failed to remove payload file");
                false
            }
        }
    }
}
