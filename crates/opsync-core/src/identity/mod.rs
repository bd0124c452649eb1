//! Node identity
//!
//! A node is identified by its Ed25519 signing key. The [`NodeId`] used for
//! routing is derived from that key, so a signed header can be checked
//! against its owner without any lookup:
//!
//! ```text
//! header.owner_key ──blake3──▶ first 8 bytes ──▶ NodeId == header.owner ?
//!                  └──ed25519 verify(signed.data, signed.signature)
//! ```
//!
//! [`NodeId`]: crate::types::NodeId

mod keypair;

pub use keypair::{verify_signature, NodeKeypair, NodePublicKey};
