//! Node keypair: Ed25519 for signing, X25519 for sealed key exchange.
//!
//! Both halves come from one 32-byte seed. The X25519 secret is derived from
//! the seed with a BLAKE3 key-derivation context, so persisting the seed is
//! enough to restore the whole identity.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};

use crate::error::{OpError, OpResult};
use crate::types::NodeId;

const EXCHANGE_KEY_CONTEXT: &str = "opsync 2026 node exchange key";

/// Signing and key-exchange secrets for the local node.
pub struct NodeKeypair {
    seed: [u8; 32],
    signing: SigningKey,
    exchange: X25519StaticSecret,
}

impl NodeKeypair {
    /// Generate a new random keypair
    pub fn generate() -> OpResult<Self> {
        // getrandom directly to avoid rand_core version conflicts with dalek
        let mut seed = [0u8; 32];
        getrandom::getrandom(&mut seed)
            .map_err(|e| OpError::Identity(format!("Failed to get random bytes: {}", e)))?;
        Ok(Self::from_seed(&seed))
    }

    /// Deterministic keypair from a 32-byte seed
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(seed);
        let exchange_bytes = blake3::derive_key(EXCHANGE_KEY_CONTEXT, seed);
        Self {
            seed: *seed,
            signing,
            exchange: X25519StaticSecret::from(exchange_bytes),
        }
    }

    pub fn public_key(&self) -> NodePublicKey {
        NodePublicKey {
            signing: self.signing.verifying_key().to_bytes(),
            exchange: X25519PublicKey::from(&self.exchange).to_bytes(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::from_public_key(self.signing.verifying_key().as_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }

    pub(crate) fn exchange_secret(&self) -> &X25519StaticSecret {
        &self.exchange
    }

    /// Serialize the secret seed
    pub fn to_bytes(&self) -> [u8; 32] {
        self.seed
    }

    pub fn from_bytes(bytes: &[u8]) -> OpResult<Self> {
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| OpError::Identity("Keypair seed must be 32 bytes".to_string()))?;
        Ok(Self::from_seed(&seed))
    }
}

impl Clone for NodeKeypair {
    fn clone(&self) -> Self {
        Self::from_seed(&self.seed)
    }
}

impl std::fmt::Debug for NodeKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeKeypair")
            .field("node_id", &self.node_id())
            .field(
                "signing_public",
                &hex::encode(self.signing.verifying_key().as_bytes()),
            )
            .finish_non_exhaustive()
    }
}

/// Public half of a node identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodePublicKey {
    /// Ed25519 verifying key
    pub signing: [u8; 32],
    /// X25519 public key for sealed keys
    pub exchange: [u8; 32],
}

impl NodePublicKey {
    pub fn node_id(&self) -> NodeId {
        NodeId::from_public_key(&self.signing)
    }

    /// Verify an Ed25519 signature made by this key.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> OpResult<()> {
        verify_signature(&self.signing, message, signature)
    }
}

/// Verify `signature` over `message` against a raw Ed25519 public key.
pub fn verify_signature(public: &[u8; 32], message: &[u8], signature: &[u8]) -> OpResult<()> {
    let key = VerifyingKey::from_bytes(public)
        .map_err(|e| OpError::SignatureInvalid(format!("bad public key: {}", e)))?;
    let signature = Signature::from_slice(signature)
        .map_err(|e| OpError::SignatureInvalid(format!("bad signature encoding: {}", e)))?;
    key.verify(message, &signature)
        .map_err(|_| OpError::SignatureInvalid("signature does not match".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_produces_distinct_ids() {
        let a = NodeKeypair::generate().unwrap();
        let b = NodeKeypair::generate().unwrap();
        assert_ne!(a.node_id(), b.node_id());
    }

    #[test]
    fn test_seed_roundtrip_keeps_identity() {
        let keypair = NodeKeypair::generate().unwrap();
        let restored = NodeKeypair::from_bytes(&keypair.to_bytes()).unwrap();
        assert_eq!(keypair.public_key(), restored.public_key());
        assert_eq!(keypair.node_id(), restored.node_id());
    }

    #[test]
    fn test_sign_and_verify() {
        let keypair = NodeKeypair::from_seed(&[3u8; 32]);
        let signature = keypair.sign(b"header bytes");
        assert!(keypair.public_key().verify(b"header bytes", &signature).is_ok());
        assert!(keypair.public_key().verify(b"other bytes", &signature).is_err());
    }

    #[test]
    fn test_foreign_key_rejects_signature() {
        let alice = NodeKeypair::from_seed(&[1u8; 32]);
        let bob = NodeKeypair::from_seed(&[2u8; 32]);
        let signature = alice.sign(b"msg");
        assert!(matches!(
            bob.public_key().verify(b"msg", &signature),
            Err(OpError::SignatureInvalid(_))
        ));
    }

    #[test]
    fn test_node_id_matches_public_key() {
        let keypair = NodeKeypair::from_seed(&[9u8; 32]);
        assert_eq!(keypair.node_id(), keypair.public_key().node_id());
    }

    #[test]
    fn test_from_bytes_rejects_wrong_length() {
        assert!(NodeKeypair::from_bytes(&[0u8; 10]).is_err());
    }
}
