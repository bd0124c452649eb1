//! Symmetric encryption, key derivation and sealed keys.
//!
//! Everything encrypted by opsync goes through [`ObjectCrypto`]
//! (ChaCha20-Poly1305 with a random nonce prepended):
//!
//! - payload files, under a per-object key
//! - headers and payloads at rest, under the node-local file key
//! - datagrams, under a per-peer key derived from the network key
//!
//! Private payload keys are wrapped per recipient with [`SealedKey`]:
//!
//! ```text
//! 1. shared   = x25519(ephemeral_sk, recipient_exchange_pk)
//! 2. wrap_key = HKDF-SHA256(shared, "opsync-sealed-key-v1")
//! 3. sealed   = ChaCha20Poly1305(wrap_key, object_key)
//! ```

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};

use crate::error::{OpError, OpResult};
use crate::identity::{NodeKeypair, NodePublicKey};
use crate::types::NodeId;

/// Nonce size for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Poly1305 tag size
pub const TAG_SIZE: usize = 16;

const SEALED_KEY_INFO: &[u8] = b"opsync-sealed-key-v1";

/// ChaCha20-Poly1305 cipher bound to one 32-byte key.
///
/// # Wire Format
///
/// `[nonce (12 bytes)] + [ciphertext + auth_tag (16 bytes)]`
///
/// # Example
///
/// ```
/// use opsync_core::crypto::ObjectCrypto;
///
/// let key = ObjectCrypto::generate_key();
/// let crypto = ObjectCrypto::new(&key);
///
/// let ciphertext = crypto.encrypt(b"post body").unwrap();
/// assert_eq!(crypto.decrypt(&ciphertext).unwrap(), b"post body");
/// ```
pub struct ObjectCrypto {
    cipher: ChaCha20Poly1305,
}

impl ObjectCrypto {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.into()),
        }
    }

    /// Generate a new random 32-byte key.
    pub fn generate_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        rand::rng().fill_bytes(&mut key);
        key
    }

    /// Encrypt with a fresh random nonce, prepended to the output.
    pub fn encrypt(&self, plaintext: &[u8]) -> OpResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| OpError::Crypto(format!("Encryption failed: {}", e)))?;

        let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// Decrypt `[nonce | ciphertext]`.
    ///
    /// Fails on a wrong key, tampered data or input shorter than nonce + tag.
    pub fn decrypt(&self, data: &[u8]) -> OpResult<Vec<u8>> {
        if data.len() < NONCE_SIZE + TAG_SIZE {
            return Err(OpError::DecryptionFailed(
                "Data too short to contain nonce and tag".to_string(),
            ));
        }
        let nonce = Nonce::from_slice(&data[..NONCE_SIZE]);
        self.cipher
            .decrypt(nonce, &data[NONCE_SIZE..])
            .map_err(|e| OpError::DecryptionFailed(e.to_string()))
    }
}

/// Derive a 32-byte key from `secret` using HKDF-SHA256 with `info`.
pub fn derive_key(secret: &[u8], info: &[u8]) -> [u8; 32] {
    let hkdf = Hkdf::<Sha256>::new(None, secret);
    let mut output = [0u8; 32];
    hkdf.expand(info, &mut output)
        .expect("HKDF expand should never fail with 32-byte output");
    output
}

/// Obfuscated, filesystem-safe name for `parts` under the node-local file key.
///
/// Keyed BLAKE3, truncated to 16 bytes, base58.
pub fn keyed_name(file_key: &[u8; 32], parts: &[&[u8]]) -> String {
    let mut hasher = blake3::Hasher::new_keyed(file_key);
    for part in parts {
        hasher.update(&(part.len() as u32).to_le_bytes());
        hasher.update(part);
    }
    let hash = hasher.finalize();
    bs58::encode(&hash.as_bytes()[..16]).into_string()
}

/// An object key wrapped for one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedKey {
    pub recipient: NodeId,
    pub ephemeral_pk: [u8; 32],
    /// Object key encrypted under the derived wrap key (nonce prepended)
    pub encrypted_key: Vec<u8>,
}

impl SealedKey {
    pub fn seal(object_key: &[u8; 32], recipient: &NodePublicKey) -> OpResult<Self> {
        let mut ephemeral_seed = [0u8; 32];
        getrandom::getrandom(&mut ephemeral_seed)
            .map_err(|e| OpError::Crypto(format!("Failed to generate ephemeral key: {}", e)))?;
        let ephemeral_secret = X25519StaticSecret::from(ephemeral_seed);
        let ephemeral_public = X25519PublicKey::from(&ephemeral_secret);

        let shared = ephemeral_secret.diffie_hellman(&X25519PublicKey::from(recipient.exchange));
        let wrap_key = derive_key(shared.as_bytes(), SEALED_KEY_INFO);
        let encrypted_key = ObjectCrypto::new(&wrap_key).encrypt(object_key)?;

        Ok(Self {
            recipient: recipient.node_id(),
            ephemeral_pk: ephemeral_public.to_bytes(),
            encrypted_key,
        })
    }

    pub fn unseal(&self, keypair: &NodeKeypair) -> OpResult<[u8; 32]> {
        if self.recipient != keypair.node_id() {
            return Err(OpError::Crypto(
                "Sealed key is not addressed to this node".to_string(),
            ));
        }
        let shared = keypair
            .exchange_secret()
            .diffie_hellman(&X25519PublicKey::from(self.ephemeral_pk));
        let wrap_key = derive_key(shared.as_bytes(), SEALED_KEY_INFO);
        let key = ObjectCrypto::new(&wrap_key).decrypt(&self.encrypted_key)?;
        key.try_into()
            .map_err(|_| OpError::Crypto("Unsealed key has wrong length".to_string()))
    }

    /// Find the entry addressed to `keypair` and unseal it.
    pub fn unseal_from(sealed: &[SealedKey], keypair: &NodeKeypair) -> OpResult<[u8; 32]> {
        let id = keypair.node_id();
        sealed
            .iter()
            .find(|s| s.recipient == id)
            .ok_or_else(|| OpError::NotFound(format!("no sealed key for {}", id)))?
            .unseal(keypair)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let crypto = ObjectCrypto::new(&ObjectCrypto::generate_key());
        let ciphertext = crypto.encrypt(b"Hello, World!").unwrap();
        assert_eq!(crypto.decrypt(&ciphertext).unwrap(), b"Hello, World!");
        assert_eq!(ciphertext.len(), 13 + NONCE_SIZE + TAG_SIZE);
    }

    #[test]
    fn test_same_plaintext_different_ciphertext() {
        let crypto = ObjectCrypto::new(&ObjectCrypto::generate_key());
        let c1 = crypto.encrypt(b"same").unwrap();
        let c2 = crypto.encrypt(b"same").unwrap();
        assert_ne!(c1, c2);
    }

    #[test]
    fn test_wrong_key_fails() {
        let c1 = ObjectCrypto::new(&[1u8; 32]);
        let c2 = ObjectCrypto::new(&[2u8; 32]);
        let ciphertext = c1.encrypt(b"Secret").unwrap();
        assert!(matches!(
            c2.decrypt(&ciphertext),
            Err(OpError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_tampered_data_fails() {
        let crypto = ObjectCrypto::new(&[4u8; 32]);
        let mut ciphertext = crypto.encrypt(b"Original message").unwrap();
        ciphertext[NONCE_SIZE] ^= 0xFF;
        assert!(crypto.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn test_truncated_data_fails() {
        let crypto = ObjectCrypto::new(&[4u8; 32]);
        assert!(crypto.decrypt(&[0u8; 5]).is_err());
    }

    #[test]
    fn test_derive_key_depends_on_info() {
        let secret = [7u8; 32];
        assert_eq!(derive_key(&secret, b"a"), derive_key(&secret, b"a"));
        assert_ne!(derive_key(&secret, b"a"), derive_key(&secret, b"b"));
    }

    #[test]
    fn test_keyed_name_is_keyed() {
        let a = keyed_name(&[1u8; 32], &[b"owner"]);
        let b = keyed_name(&[2u8; 32], &[b"owner"]);
        assert_ne!(a, b);
        assert_eq!(a, keyed_name(&[1u8; 32], &[b"owner"]));
        // length prefix separates parts
        assert_ne!(
            keyed_name(&[1u8; 32], &[b"ab", b"c"]),
            keyed_name(&[1u8; 32], &[b"a", b"bc"])
        );
    }

    #[test]
    fn test_sealed_key_roundtrip() {
        let recipient = NodeKeypair::from_seed(&[5u8; 32]);
        let object_key = ObjectCrypto::generate_key();

        let sealed = SealedKey::seal(&object_key, &recipient.public_key()).unwrap();
        assert_eq!(sealed.recipient, recipient.node_id());
        assert_eq!(sealed.unseal(&recipient).unwrap(), object_key);
    }

    #[test]
    fn test_sealed_key_wrong_recipient() {
        let recipient = NodeKeypair::from_seed(&[5u8; 32]);
        let other = NodeKeypair::from_seed(&[6u8; 32]);
        let sealed = SealedKey::seal(&[9u8; 32], &recipient.public_key()).unwrap();
        assert!(sealed.unseal(&other).is_err());
        assert!(SealedKey::unseal_from(&[sealed], &other).is_err());
    }
}
