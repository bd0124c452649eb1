//! Node-local secrets and known peers, persisted with redb.
//!
//! Object data never lives here: service caches keep their own encrypted
//! files. This database only holds what a node needs to come back as itself:
//! - the identity seed
//! - the file key that encrypts every cache file at rest
//! - last known contact addresses, used to rejoin without a bootstrap peer

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use tracing::info;

use crate::crypto::ObjectCrypto;
use crate::error::{OpError, OpResult};
use crate::identity::NodeKeypair;
use crate::protocol::ContactInfo;
use crate::types::NodeId;

/// Database file name inside the data directory
pub const DB_FILE: &str = "opsync.redb";

const IDENTITY_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("identity");
const SECRETS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("secrets");
const PEERS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("peers");

/// Storage layer using redb for ACID-compliant persistence
#[derive(Clone)]
pub struct Storage {
    db: Arc<RwLock<Database>>,
}

impl Storage {
    /// Open or create the database at `path`, creating every table.
    pub fn new(path: impl AsRef<Path>) -> OpResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(IDENTITY_TABLE)?;
            let _ = write_txn.open_table(SECRETS_TABLE)?;
            let _ = write_txn.open_table(PEERS_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    /// Open the database inside a data directory
    pub fn open_in(data_dir: impl AsRef<Path>) -> OpResult<Self> {
        Self::new(data_dir.as_ref().join(DB_FILE))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Identity Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Identity storage key (there's only one identity per node)
    const IDENTITY_KEY: &'static str = "node_identity";

    pub fn save_identity(&self, keypair: &NodeKeypair) -> OpResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(IDENTITY_TABLE)?;
            let data = keypair.to_bytes();
            table.insert(Self::IDENTITY_KEY, data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Returns `None` if no identity has been created yet.
    pub fn load_identity(&self) -> OpResult<Option<NodeKeypair>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(IDENTITY_TABLE)?;

        match table.get(Self::IDENTITY_KEY)? {
            Some(v) => Ok(Some(NodeKeypair::from_bytes(v.value())?)),
            None => Ok(None),
        }
    }

    pub fn has_identity(&self) -> OpResult<bool> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(IDENTITY_TABLE)?;
        Ok(table.get(Self::IDENTITY_KEY)?.is_some())
    }

    /// Load the stored identity, generating and saving one on first run.
    ///
    /// This ensures stable node identity across restarts.
    pub fn load_or_create_identity(&self) -> OpResult<NodeKeypair> {
        if let Some(keypair) = self.load_identity()? {
            return Ok(keypair);
        }
        let keypair = NodeKeypair::generate()?;
        self.save_identity(&keypair)?;
        info!(node = %keypair.node_id(), "created new node identity");
        Ok(keypair)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // File Key Operations
    // ═══════════════════════════════════════════════════════════════════════

    const FILE_KEY: &'static str = "file_key";

    /// Key that encrypts cache files at rest, created on first use
    pub fn load_or_create_file_key(&self) -> OpResult<[u8; 32]> {
        {
            let db = self.db.read();
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(SECRETS_TABLE)?;
            if let Some(v) = table.get(Self::FILE_KEY)? {
                return v
                    .value()
                    .try_into()
                    .map_err(|_| OpError::Storage("stored file key is not 32 bytes".to_string()));
            }
        }

        let key = ObjectCrypto::generate_key();
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(SECRETS_TABLE)?;
            table.insert(Self::FILE_KEY, key.as_slice())?;
        }
        write_txn.commit()?;
        Ok(key)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Peer Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Replace the stored contacts with `contacts`.
    pub fn save_peers(&self, contacts: &[ContactInfo]) -> OpResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(PEERS_TABLE)?;
            let stale: Vec<String> = table
                .iter()?
                .filter_map(|entry| entry.ok().map(|(k, _)| k.value().to_string()))
                .collect();
            for key in stale {
                table.remove(key.as_str())?;
            }
            for contact in contacts {
                let data = serde_json::to_vec(&contact.addr)
                    .map_err(|e| OpError::Serialization(e.to_string()))?;
                table.insert(contact.id.to_string().as_str(), data.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn load_peers(&self) -> OpResult<Vec<ContactInfo>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(PEERS_TABLE)?;

        let mut peers = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            let Some(id) = NodeId::from_hex(key.value()) else {
                continue;
            };
            let addr: SocketAddr = serde_json::from_slice(value.value())
                .map_err(|e| OpError::Serialization(e.to_string()))?;
            peers.push(ContactInfo { id, addr });
        }
        Ok(peers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::open_in(temp_dir.path()).unwrap();
        (storage, temp_dir)
    }

    #[test]
    fn test_save_and_load_identity() {
        let (storage, _temp_dir) = create_test_storage();

        assert!(!storage.has_identity().unwrap());
        assert!(storage.load_identity().unwrap().is_none());

        let keypair = NodeKeypair::from_seed(&[3u8; 32]);
        storage.save_identity(&keypair).unwrap();

        assert!(storage.has_identity().unwrap());
        let loaded = storage.load_identity().unwrap().unwrap();
        assert_eq!(loaded.node_id(), keypair.node_id());
    }

    #[test]
    fn test_identity_stable_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let first = {
            let storage = Storage::open_in(temp_dir.path()).unwrap();
            storage.load_or_create_identity().unwrap().node_id()
        };
        let storage = Storage::open_in(temp_dir.path()).unwrap();
        assert_eq!(storage.load_or_create_identity().unwrap().node_id(), first);
    }

    #[test]
    fn test_file_key_created_once() {
        let (storage, _temp_dir) = create_test_storage();
        let key = storage.load_or_create_file_key().unwrap();
        assert_eq!(storage.load_or_create_file_key().unwrap(), key);
    }

    #[test]
    fn test_peers_replaced_on_save() {
        let (storage, _temp_dir) = create_test_storage();
        let a = ContactInfo {
            id: NodeId(1),
            addr: "127.0.0.1:4000".parse().unwrap(),
        };
        let b = ContactInfo {
            id: NodeId(0xfeed),
            addr: "[::1]:4001".parse().unwrap(),
        };
        storage.save_peers(&[a, b]).unwrap();
        let mut loaded = storage.load_peers().unwrap();
        loaded.sort_by_key(|c| c.id);
        assert_eq!(loaded, vec![a, b]);

        storage.save_peers(&[b]).unwrap();
        assert_eq!(storage.load_peers().unwrap(), vec![b]);
    }
}
