//! Datagram framing: `[len: u16 LE][kind: u8][body: len bytes]`

use crate::config::MAX_DATAGRAM_SIZE;
use crate::error::{OpError, OpResult};
use crate::protocol::PacketKind;

/// Size of the frame header
pub const HEADER_SIZE: usize = 3;

/// Frame `body` under `kind`, refusing anything over the datagram ceiling.
pub fn encode(kind: PacketKind, body: &[u8]) -> OpResult<Vec<u8>> {
    let size = HEADER_SIZE + body.len();
    if size > MAX_DATAGRAM_SIZE {
        return Err(OpError::PacketTooLarge {
            size,
            max: MAX_DATAGRAM_SIZE,
        });
    }
    let mut out = Vec::with_capacity(size);
    out.extend_from_slice(&(body.len() as u16).to_le_bytes());
    out.push(kind as u8);
    out.extend_from_slice(body);
    Ok(out)
}

/// Read the header first, then a body of exactly `len` bytes; nothing may follow it.
pub fn decode(datagram: &[u8]) -> OpResult<(PacketKind, &[u8])> {
    if datagram.len() < HEADER_SIZE {
        return Err(OpError::MalformedPacket(format!(
            "datagram of {} bytes has no header",
            datagram.len()
        )));
    }
    if datagram.len() > MAX_DATAGRAM_SIZE {
        return Err(OpError::PacketTooLarge {
            size: datagram.len(),
            max: MAX_DATAGRAM_SIZE,
        });
    }
    let len = u16::from_le_bytes([datagram[0], datagram[1]]) as usize;
    let kind = PacketKind::from_byte(datagram[2])
        .ok_or_else(|| OpError::MalformedPacket(format!("unknown kind {}", datagram[2])))?;
    if datagram.len() != HEADER_SIZE + len {
        return Err(OpError::MalformedPacket(format!(
            "frame claims {} body bytes, datagram carries {}",
            len,
            datagram.len() - HEADER_SIZE
        )));
    }
    Ok((kind, &datagram[HEADER_SIZE..]))
}
