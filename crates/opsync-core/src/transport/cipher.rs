//! Per-peer datagram encryption.
//!
//! ```text
//! send to B:     key = HKDF(network_key, "opsync-peer" || B.id)
//! receive at B:  key = HKDF(network_key, "opsync-peer" || B.id)   (own id)
//! ping / pong:   key = HKDF(network_key, "opsync-hello")
//! ```
//!
//! A datagram is only readable by the node it was addressed to, and only by
//! nodes that share the network key.

use crate::crypto::{derive_key, ObjectCrypto};
use crate::error::{OpError, OpResult};
use crate::protocol::{Message, PacketKind};
use crate::transport::frame;
use crate::types::NodeId;

const PEER_INFO: &[u8] = b"opsync-peer";
const HELLO_INFO: &[u8] = b"opsync-hello";

/// Turns messages into encrypted frames and back
pub struct PacketCodec {
    network_key: [u8; 32],
    local_id: NodeId,
    hello: ObjectCrypto,
    inbound: ObjectCrypto,
}

impl PacketCodec {
    pub fn new(network_key: [u8; 32], local_id: NodeId) -> Self {
        let hello = ObjectCrypto::new(&derive_key(&network_key, HELLO_INFO));
        let inbound = ObjectCrypto::new(&peer_key(&network_key, local_id));
        Self {
            network_key,
            local_id,
            hello,
            inbound,
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// Encrypt and frame `message` for `dest`.
    pub fn encode(&self, message: &Message, dest: Option<NodeId>) -> OpResult<Vec<u8>> {
        let kind = message.packet.kind();
        let plaintext = message.encode()?;
        let body = if kind.uses_network_key() {
            self.hello.encrypt(&plaintext)?
        } else {
            let dest = dest.ok_or_else(|| {
                OpError::Crypto(format!("{} packet needs a destination id", kind.as_str()))
            })?;
            ObjectCrypto::new(&peer_key(&self.network_key, dest)).encrypt(&plaintext)?
        };
        frame::encode(kind, &body)
    }

    /// Unframe and decrypt a datagram addressed to this node.
    pub fn decode(&self, datagram: &[u8]) -> OpResult<Message> {
        let (kind, body) = frame::decode(datagram)?;
        let plaintext = if kind.uses_network_key() {
            self.hello.decrypt(body)?
        } else {
            self.inbound.decrypt(body)?
        };
        let message = Message::decode(&plaintext)?;
        if message.packet.kind() != kind {
            return Err(OpError::MalformedPacket(format!(
                "frame kind {} does not match packet {}",
                kind.as_str(),
                message.packet.kind().as_str()
            )));
        }
        Ok(message)
    }
}

fn peer_key(network_key: &[u8; 32], id: NodeId) -> [u8; 32] {
    let mut info = Vec::with_capacity(PEER_INFO.len() + NodeId::SIZE);
    info.extend_from_slice(PEER_INFO);
    info.extend_from_slice(&id.to_le_bytes());
    derive_key(network_key, &info)
}
