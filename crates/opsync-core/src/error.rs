//! Error types for opsync

use thiserror::Error;

use crate::types::{NodeId, Version};

/// Main error type for opsync operations
#[derive(Error, Debug)]
pub enum OpError {
    /// Signed header did not verify against the owner's public key
    #[error("Signature invalid: {0}")]
    SignatureInvalid(String),

    /// A peer sent an older version than the one cached locally
    #[error("Version regression for owner {owner}: remote {remote}, local {local}")]
    VersionRegression {
        owner: NodeId,
        remote: Version,
        local: Version,
    },

    /// Datagram or envelope could not be parsed
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// Patch digest length is not a whole number of entries
    #[error("Malformed digest: {len} bytes is not a multiple of {entry_size}")]
    MalformedDigest { len: usize, entry_size: usize },

    /// Payload file referenced by a header is not on disk yet
    #[error("Payload missing: {0}")]
    PayloadMissing(String),

    /// Outbound datagram exceeds the transport ceiling
    #[error("Packet of {size} bytes exceeds the {max} byte limit")]
    PacketTooLarge { size: usize, max: usize },

    /// Operation needs an established network
    #[error("Network not established")]
    NetworkUnestablished,

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Decryption failed (wrong key, tampered data, or malformed input)
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Identity-related error (keys, node ids)
    #[error("Identity error: {0}")]
    Identity(String),

    /// Configuration could not be read or parsed
    #[error("Config error: {0}")]
    Config(String),

    /// Service tag has no registered handler
    #[error("Unknown service: {0}")]
    UnknownService(u32),

    /// Object was not found in the cache
    #[error("Object not found: {0}")]
    NotFound(String),

    /// A monotonic counter (version, post id) has no values left
    #[error("Counter exhausted: {0}")]
    Exhausted(String),

    /// Core loop is gone
    #[error("Node stopped")]
    NodeStopped,

    /// Error during storage operations (redb)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// General disk I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<postcard::Error> for OpError {
    fn from(err: postcard::Error) -> Self {
        OpError::Serialization(err.to_string())
    }
}

/// Result type alias using OpError
pub type OpResult<T> = Result<T, OpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OpError::MalformedDigest {
            len: 13,
            entry_size: 20,
        };
        assert_eq!(
            format!("{}", err),
            "Malformed digest: 13 bytes is not a multiple of 20"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let op_err: OpError = io_err.into();
        assert!(matches!(op_err, OpError::Io(_)));
    }

    #[test]
    fn test_version_regression_display() {
        let err = OpError::VersionRegression {
            owner: NodeId(10),
            remote: 5,
            local: 7,
        };
        let text = err.to_string();
        assert!(text.contains("remote 5"));
        assert!(text.contains("local 7"));
    }
}
