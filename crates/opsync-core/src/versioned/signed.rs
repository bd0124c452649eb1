//! Signed envelopes and the generic object header they carry.

use serde::{Deserialize, Serialize};

use crate::crypto::SealedKey;
use crate::error::{OpError, OpResult};
use crate::identity::{verify_signature, NodeKeypair};
use crate::types::{now_millis, NodeId, ObjectKey, PayloadRef, ServiceTag, Version};

/// Canonical header bytes plus an Ed25519 signature over exactly those bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedData {
    pub data: Vec<u8>,
    pub signature: Vec<u8>,
}

impl SignedData {
    /// Serialize `header` and sign the bytes with `keypair`.
    pub fn sign(keypair: &NodeKeypair, header: &ObjectHeader) -> OpResult<Self> {
        let data = postcard::to_allocvec(header)?;
        let signature = keypair.sign(&data).to_vec();
        Ok(Self { data, signature })
    }

    pub fn encode(&self) -> OpResult<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> OpResult<Self> {
        postcard::from_bytes(bytes).map_err(|e| OpError::MalformedPacket(e.to_string()))
    }

    /// Decode the header and check it against its owner.
    ///
    /// The embedded public key must hash to the header's owner id and the
    /// signature must verify under it. Nothing is returned on failure.
    pub fn verify(&self) -> OpResult<ObjectHeader> {
        let header: ObjectHeader = postcard::from_bytes(&self.data)
            .map_err(|e| OpError::MalformedPacket(format!("header: {}", e)))?;
        if NodeId::from_public_key(&header.owner_key) != header.owner {
            return Err(OpError::SignatureInvalid(format!(
                "public key does not belong to owner {}",
                header.owner
            )));
        }
        verify_signature(&header.owner_key, &self.data, &self.signature)?;
        Ok(header)
    }
}

/// How the payload's object key travels with the header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadKey {
    /// No payload
    None,
    /// Broadcast content: key readable by anyone holding the header
    Clear([u8; 32]),
    /// Private delivery: key wrapped per recipient
    Sealed(Vec<SealedKey>),
}

/// Header every versioned object carries, whatever service it belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectHeader {
    pub service: ServiceTag,
    pub owner: NodeId,
    /// Ed25519 public key of the owner
    pub owner_key: [u8; 32],
    pub key: ObjectKey,
    pub version: Version,
    /// Unix millis of the last edit
    pub edit_time: i64,
    pub payload: Option<PayloadRef>,
    pub payload_key: PayloadKey,
    /// Service-specific fields
    pub body: Vec<u8>,
}

impl ObjectHeader {
    /// First version of a new object owned by `keypair`
    pub fn new(keypair: &NodeKeypair, service: ServiceTag, key: ObjectKey, body: Vec<u8>) -> Self {
        Self {
            service,
            owner: keypair.node_id(),
            owner_key: keypair.public_key().signing,
            key,
            version: 1,
            edit_time: now_millis(),
            payload: None,
            payload_key: PayloadKey::None,
            body,
        }
    }

    /// Next version of this object: same key, version + 1, fresh edit time.
    pub fn edited(&self) -> OpResult<Self> {
        let version = self.version.checked_add(1).ok_or_else(|| {
            OpError::Exhausted(format!("{} {} is at its last version", self.owner, self.key))
        })?;
        let mut next = self.clone();
        next.version = version;
        next.edit_time = now_millis().max(self.edit_time);
        Ok(next)
    }

    pub fn with_payload(mut self, payload: PayloadRef, key: PayloadKey) -> Self {
        self.payload = Some(payload);
        self.payload_key = key;
        self
    }

    /// Object key usable by `keypair` to read the payload, if any.
    pub fn object_key(&self, keypair: Option<&NodeKeypair>) -> OpResult<Option<[u8; 32]>> {
        match &self.payload_key {
            PayloadKey::None => Ok(None),
            PayloadKey::Clear(key) => Ok(Some(*key)),
            PayloadKey::Sealed(sealed) => {
                let keypair = keypair.ok_or_else(|| {
                    OpError::Crypto("sealed payload needs a local keypair".to_string())
                })?;
                SealedKey::unseal_from(sealed, keypair).map(Some)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(keypair: &NodeKeypair) -> ObjectHeader {
        ObjectHeader::new(
            keypair,
            ServiceTag::BOARD,
            ObjectKey(vec![1, 2, 3, 4]),
            b"body".to_vec(),
        )
    }

    #[test]
    fn test_sign_then_verify() {
        let keypair = NodeKeypair::from_seed(&[1u8; 32]);
        let signed = SignedData::sign(&keypair, &header(&keypair)).unwrap();
        let decoded = SignedData::decode(&signed.encode().unwrap()).unwrap();
        let verified = decoded.verify().unwrap();
        assert_eq!(verified.owner, keypair.node_id());
        assert_eq!(verified.body, b"body");
    }

    #[test]
    fn test_tampered_header_rejected() {
        let keypair = NodeKeypair::from_seed(&[1u8; 32]);
        let mut signed = SignedData::sign(&keypair, &header(&keypair)).unwrap();
        let last = signed.data.len() - 1;
        signed.data[last] ^= 0x01;
        assert!(signed.verify().is_err());
    }

    #[test]
    fn test_impersonation_rejected() {
        // mallory signs a header claiming alice's id with mallory's key
        let alice = NodeKeypair::from_seed(&[1u8; 32]);
        let mallory = NodeKeypair::from_seed(&[2u8; 32]);
        let mut forged = header(&mallory);
        forged.owner = alice.node_id();
        let signed = SignedData::sign(&mallory, &forged).unwrap();
        assert!(matches!(signed.verify(), Err(OpError::SignatureInvalid(_))));
    }

    #[test]
    fn test_foreign_signature_rejected() {
        // correct owner key embedded but signed by someone else
        let alice = NodeKeypair::from_seed(&[1u8; 32]);
        let mallory = NodeKeypair::from_seed(&[2u8; 32]);
        let signed = SignedData::sign(&mallory, &header(&alice)).unwrap();
        assert!(matches!(signed.verify(), Err(OpError::SignatureInvalid(_))));
    }

    #[test]
    fn test_edit_bumps_version_keeps_key() {
        let keypair = NodeKeypair::from_seed(&[1u8; 32]);
        let first = header(&keypair);
        let second = first.edited().unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
        assert_eq!(second.key, first.key);
        assert!(second.edit_time >= first.edit_time);
    }

    #[test]
    fn test_edit_at_last_version_fails() {
        let keypair = NodeKeypair::from_seed(&[1u8; 32]);
        let mut last = header(&keypair);
        last.version = Version::MAX;
        assert!(matches!(last.edited(), Err(OpError::Exhausted(_))));
    }

    #[test]
    fn test_garbage_does_not_decode() {
        assert!(SignedData::decode(&[0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn test_object_key_variants() {
        let keypair = NodeKeypair::from_seed(&[1u8; 32]);
        let recipient = NodeKeypair::from_seed(&[3u8; 32]);
        let payload = PayloadRef::new([0u8; 32], 10);

        let clear = header(&keypair).with_payload(payload, PayloadKey::Clear([8u8; 32]));
        assert_eq!(clear.object_key(None).unwrap(), Some([8u8; 32]));

        let sealed_key = SealedKey::seal(&[9u8; 32], &recipient.public_key()).unwrap();
        let sealed = header(&keypair).with_payload(payload, PayloadKey::Sealed(vec![sealed_key]));
        assert_eq!(sealed.object_key(Some(&recipient)).unwrap(), Some([9u8; 32]));
        assert!(sealed.object_key(Some(&keypair)).is_err());

        assert_eq!(header(&keypair).object_key(None).unwrap(), None);
    }
}
