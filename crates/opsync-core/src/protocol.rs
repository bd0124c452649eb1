//! Network packets exchanged between nodes.
//!
//! Packets are serialized with postcard, encrypted by the transport and
//! framed as `[len u16 LE][kind u8][body]`.
//!
//! ## Message Flow
//!
//! ```text
//! Node A                                Node B
//!   |--- Ping ------------------------->|   (learn id + address)
//!   |<-- Pong --------------------------|
//!   |<-- Patch {digest per service} ----|   (B now covers A's owners)
//!   |--- Store {signed header} -------->|   (A is newer)
//!   |--- SearchReq {target, params} --->|   (A is older)
//!   |<-- SearchAck {results, closer} ---|
//! ```

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::error::{OpError, OpResult};
use crate::types::{NodeId, ServiceTag};

/// Identifier of an outstanding search
pub type SearchId = u64;

/// Frame kind byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    Ping = 1,
    Pong = 2,
    Store = 3,
    Patch = 4,
    SearchReq = 5,
    SearchAck = 6,
}

impl PacketKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            1 => PacketKind::Ping,
            2 => PacketKind::Pong,
            3 => PacketKind::Store,
            4 => PacketKind::Patch,
            5 => PacketKind::SearchReq,
            6 => PacketKind::SearchAck,
            _ => return None,
        })
    }

    /// Ping and Pong are sent before the peer's id is known, so they use the
    /// network-wide key instead of a per-peer key.
    pub fn uses_network_key(&self) -> bool {
        matches!(self, PacketKind::Ping | PacketKind::Pong)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PacketKind::Ping => "ping",
            PacketKind::Pong => "pong",
            PacketKind::Store => "store",
            PacketKind::Patch => "patch",
            PacketKind::SearchReq => "search_req",
            PacketKind::SearchAck => "search_ack",
        }
    }
}

/// A peer reference handed out in search acks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactInfo {
    pub id: NodeId,
    pub addr: SocketAddr,
}

/// Packets understood by every node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Packet {
    Ping,
    Pong,
    /// A signed object pushed to a custodian
    Store {
        service: ServiceTag,
        /// `SignedData` bytes
        data: Vec<u8>,
    },
    /// Digests of objects the sender holds, one per service
    Patch { digests: Vec<(ServiceTag, Vec<u8>)> },
    SearchReq {
        search_id: SearchId,
        target: NodeId,
        service: ServiceTag,
        params: Vec<u8>,
    },
    SearchAck {
        search_id: SearchId,
        service: ServiceTag,
        results: Vec<Vec<u8>>,
        /// Responder's contacts nearest the search target
        closer: Vec<ContactInfo>,
    },
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Ping => PacketKind::Ping,
            Packet::Pong => PacketKind::Pong,
            Packet::Store { .. } => PacketKind::Store,
            Packet::Patch { .. } => PacketKind::Patch,
            Packet::SearchReq { .. } => PacketKind::SearchReq,
            Packet::SearchAck { .. } => PacketKind::SearchAck,
        }
    }
}

/// A packet plus its claimed sender
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub sender: NodeId,
    pub packet: Packet,
}

impl Message {
    pub fn new(sender: NodeId, packet: Packet) -> Self {
        Self { sender, packet }
    }

    pub fn encode(&self) -> OpResult<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> OpResult<Self> {
        postcard::from_bytes(bytes).map_err(|e| OpError::MalformedPacket(e.to_string()))
    }
}

/// A packet waiting in the outbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub addr: SocketAddr,
    /// Destination id, if known; `None` only for Ping/Pong
    pub dest: Option<NodeId>,
    pub packet: Packet,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_byte_roundtrip() {
        for kind in [
            PacketKind::Ping,
            PacketKind::Pong,
            PacketKind::Store,
            PacketKind::Patch,
            PacketKind::SearchReq,
            PacketKind::SearchAck,
        ] {
            assert_eq!(PacketKind::from_byte(kind as u8), Some(kind));
        }
        assert_eq!(PacketKind::from_byte(0), None);
        assert_eq!(PacketKind::from_byte(200), None);
    }

    #[test]
    fn test_message_decode_rejects_garbage() {
        assert!(matches!(
            Message::decode(&[0xff; 4]),
            Err(OpError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_search_ack_encodes() {
        let msg = Message::new(
            NodeId(3),
            Packet::SearchAck {
                search_id: 9,
                service: ServiceTag::BOARD,
                results: vec![vec![1, 2, 3]],
                closer: vec![ContactInfo {
                    id: NodeId(4),
                    addr: "127.0.0.1:4970".parse().unwrap(),
                }],
            },
        );
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.packet.kind(), PacketKind::SearchAck);
    }
}
