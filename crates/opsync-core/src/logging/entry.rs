//! Log entry types for JSONL-based logging.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::PacketKind;

/// A single log line.
///
/// Each entry is self-contained, so JSONL files can be appended to without
/// coordination and read back line by line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonLogEntry {
    /// RFC 3339 timestamp with millis
    pub ts: String,

    /// trace, debug, info, warn, error
    pub level: String,

    /// Node id (hex) of the writer
    pub node: String,

    /// Module path / target (e.g., "opsync_core::store")
    pub target: String,

    pub msg: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Value>,

    /// Span path if emitted inside spans, outermost first
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span: Option<String>,
}

impl JsonLogEntry {
    pub fn new(
        level: impl Into<String>,
        node: impl Into<String>,
        target: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            level: level.into(),
            node: node.into(),
            target: target.into(),
            msg: msg.into(),
            fields: None,
            span: None,
        }
    }

    pub fn with_fields(mut self, fields: Value) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn with_span(mut self, span: impl Into<String>) -> Self {
        self.span = Some(span.into());
        self
    }

    /// Serialize to a single JSON line (no trailing newline).
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

/// Which way a datagram went
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

/// One datagram in the packet log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketLogEntry {
    pub direction: Direction,
    pub addr: SocketAddr,
    pub kind: String,
    pub size: usize,
}

impl PacketLogEntry {
    pub fn new(direction: Direction, addr: SocketAddr, kind: PacketKind, size: usize) -> Self {
        Self {
            direction,
            addr,
            kind: kind.as_str().to_string(),
            size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_entry_serialization() {
        let entry = JsonLogEntry::new("info", "00ff", "opsync_core::store", "stored object");

        let json = entry.to_json_line().unwrap();
        assert!(json.contains("\"level\":\"info\""));
        assert!(json.contains("\"node\":\"00ff\""));
        assert!(!json.contains("\"fields\""));

        let parsed = JsonLogEntry::from_json_line(&json).unwrap();
        assert_eq!(parsed.msg, "stored object");
    }

    #[test]
    fn test_packet_entry_serialization() {
        let entry = PacketLogEntry::new(
            Direction::Out,
            "127.0.0.1:4970".parse().unwrap(),
            PacketKind::Patch,
            120,
        );
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"direction\":\"out\""));
        assert!(json.contains("\"kind\":\"patch\""));
    }
}
