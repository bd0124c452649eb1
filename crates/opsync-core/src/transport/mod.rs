//! Encrypted, unreliable datagram transport.
//!
//! ```text
//!   Outbound ──▶ Message ──postcard──▶ ChaCha20Poly1305(peer key) ──▶ frame ──▶ UDP
//!   UDP ──▶ frame ──▶ decrypt(own key) ──▶ Message ──▶ Inbound ──mpsc──▶ core loop
//! ```

pub mod cipher;
pub mod frame;
mod udp;

pub use cipher::PacketCodec;
pub use udp::{Inbound, UdpTransport};
