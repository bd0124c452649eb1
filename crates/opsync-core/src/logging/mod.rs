//! Per-node JSONL logging and the packet log.
//!
//! ```text
//! <data>/logs/
//! ├── 2026-10-19_3fa1c0d2e4b59a77.jsonl
//! └── 2026-10-19_9c0e11a8f2d34b60.jsonl
//! ```
//!
//! Datagrams are logged as structured events on the `opsync::packets`
//! target, so they can be filtered in or out with `RUST_LOG`:
//!
//! ```bash
//! RUST_LOG=info,opsync::packets=debug opsync serve
//! jq 'select(.target == "opsync::packets")' logs/*.jsonl
//! ```

pub mod entry;
pub mod layer;
pub mod writer;

pub use entry::{Direction, JsonLogEntry, PacketLogEntry};
pub use layer::NodeLogLayer;
pub use writer::{read_all_entries, NodeLogWriter};

/// tracing target of packet log events
pub const PACKET_TARGET: &str = "opsync::packets";

/// Emit one packet log event.
pub fn log_packet(entry: &PacketLogEntry) {
    tracing::debug!(
        target: PACKET_TARGET,
        direction = entry.direction.as_str(),
        addr = %entry.addr,
        kind = %entry.kind,
        size = entry.size as u64,
        "packet"
    );
}
