//! At-rest files: encrypted headers collections and payloads.
//!
//! Every write goes to a temp file in the target directory and is renamed
//! into place, so a crash never leaves a half-written file behind.
//!
//! ```text
//! headers file  = ObjectCrypto(file_key)   [ postcard Vec<SignedData bytes> ]
//! payload file  = ObjectCrypto(object_key) [ service payload bytes ]
//! PayloadRef    = { blake3(payload file), len(payload file) }
//! ```

use std::io::{Read, Write};
use std::path::Path;

use tempfile::NamedTempFile;

use crate::crypto::ObjectCrypto;
use crate::error::{OpError, OpResult};
use crate::types::PayloadRef;

/// Atomically write `bytes` to `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> OpResult<()> {
    let dir = path
        .parent()
        .ok_or_else(|| OpError::Storage(format!("{} has no parent", path.display())))?;
    std::fs::create_dir_all(dir)?;
    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| OpError::Io(e.error))?;
    Ok(())
}

/// Encrypt `plaintext` under `key` and write it atomically.
pub fn write_encrypted(path: &Path, key: &[u8; 32], plaintext: &[u8]) -> OpResult<()> {
    let ciphertext = ObjectCrypto::new(key).encrypt(plaintext)?;
    write_atomic(path, &ciphertext)
}

pub fn read_encrypted(path: &Path, key: &[u8; 32]) -> OpResult<Vec<u8>> {
    let ciphertext = std::fs::read(path)?;
    ObjectCrypto::new(key).decrypt(&ciphertext)
}

/// Save a collection of signed headers under the node-local file key.
pub fn save_headers(path: &Path, file_key: &[u8; 32], headers: &[Vec<u8>]) -> OpResult<()> {
    let bytes = postcard::to_allocvec(headers)?;
    write_encrypted(path, file_key, &bytes)
}

/// Load a collection written by [`save_headers`].
pub fn load_headers(path: &Path, file_key: &[u8; 32]) -> OpResult<Vec<Vec<u8>>> {
    let bytes = read_encrypted(path, file_key)?;
    Ok(postcard::from_bytes(&bytes)?)
}

/// Encrypt a payload under its object key, returning the file bytes and their reference.
pub fn seal_payload(object_key: &[u8; 32], plaintext: &[u8]) -> OpResult<(Vec<u8>, PayloadRef)> {
    let ciphertext = ObjectCrypto::new(object_key).encrypt(plaintext)?;
    let payload = PayloadRef::new(*blake3::hash(&ciphertext).as_bytes(), ciphertext.len() as u64);
    Ok((ciphertext, payload))
}

pub fn open_payload(path: &Path, object_key: &[u8; 32]) -> OpResult<Vec<u8>> {
    read_encrypted(path, object_key)
}

/// Hash and size of a file on disk
pub fn hash_file(path: &Path) -> OpResult<PayloadRef> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = [0u8; 16 * 1024];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok(PayloadRef::new(*hasher.finalize().as_bytes(), size))
}

/// True if the file at `path` exists and matches `expected`.
pub fn payload_matches(path: &Path, expected: &PayloadRef) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) if meta.len() == expected.size => {
            matches!(hash_file(path), Ok(actual) if actual == *expected)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_headers_roundtrip_encrypted() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("owner").join("headers");
        let key = [3u8; 32];
        let headers = vec![b"one".to_vec(), b"two".to_vec()];

        save_headers(&path, &key, &headers).unwrap();
        assert_eq!(load_headers(&path, &key).unwrap(), headers);

        // not readable in the clear, not readable with another key
        let raw = std::fs::read(&path).unwrap();
        assert!(!raw.windows(3).any(|w| w == b"two"));
        assert!(load_headers(&path, &[4u8; 32]).is_err());
    }

    #[test]
    fn test_write_atomic_replaces_and_leaves_no_temp() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("file");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        let entries: Vec<_> = std::fs::read_dir(temp.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_payload_ref_matches_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("payload");
        let object_key = [5u8; 32];

        let (bytes, payload) = seal_payload(&object_key, b"message text").unwrap();
        write_atomic(&path, &bytes).unwrap();

        assert_eq!(hash_file(&path).unwrap(), payload);
        assert!(payload_matches(&path, &payload));
        assert_eq!(open_payload(&path, &object_key).unwrap(), b"message text");

        let wrong = PayloadRef::new([0u8; 32], payload.size);
        assert!(!payload_matches(&path, &wrong));
        assert!(!payload_matches(&temp.path().join("missing"), &payload));
    }
}
