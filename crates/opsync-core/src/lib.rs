//! opsync core library
//!
//! A replicated, versioned, signed object store spread over a keyspace of
//! peer ids, kept consistent by digest exchange and targeted search, and
//! carried over an encrypted datagram link.
//!
//! ## Overview
//!
//! Every feature (boards, mail, schedules) plugs into one mechanism: an
//! owner signs versioned objects, the nodes nearest the owner's id keep them,
//! and peers repair each other by swapping compact `{owner, key, version}`
//! digests. Conflicts can only be stale-versus-current, so the newest valid
//! signature always wins.
//!
//! ```text
//!            ┌──────────── Node (one tokio task) ─────────────┐
//!  UDP ◀────▶│ transport ─▶ ObjectStore ─▶ ServiceCache<Board> │
//!            │                  │  search / patch / replicate  │
//!            └──────────────────┴──────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use opsync_core::{node, NodeConfig, PostContent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = node::default_options("~/.opsync", NodeConfig::default(), "0.0.0.0".parse()?);
//!     let (handle, _task) = opsync_core::Node::start(options).await?;
//!
//!     handle.bootstrap("203.0.113.7:4970".parse()?).await?;
//!     handle.post_message(1, None, None, PostContent::new("hello", "first post")).await?;
//!
//!     for thread in handle.threads(1) {
//!         println!("{} {:?}", thread.owner, thread.subject);
//!     }
//!     Ok(())
//! }
//! ```

pub mod board;
pub mod cache;
pub mod collaborators;
pub mod config;
pub mod crypto;
pub mod digest;
pub mod error;
pub mod identity;
pub mod logging;
pub mod node;
pub mod protocol;
pub mod routing;
pub mod search;
pub mod storage;
pub mod store;
pub mod transport;
pub mod types;
pub mod versioned;

// Re-exports
pub use board::{Board, BoardQuery, PostContent, PostSummary, ThreadRef};
pub use cache::{CacheSpec, SealedPayload, ServiceCache, UniqueState};
pub use collaborators::{NoTrust, NullTransfers, StaticTrust, TransferQueue, Transfers, TrustLinks};
pub use config::NodeConfig;
pub use error::{OpError, OpResult};
pub use identity::{NodeKeypair, NodePublicKey};
pub use node::{Node, NodeEvent, NodeHandle, NodeInfo, NodeOptions};
pub use protocol::{ContactInfo, Message, Packet};
pub use routing::RoutingTable;
pub use storage::Storage;
pub use store::{ObjectStore, Service, StoreContext};
pub use types::*;
pub use versioned::{ObjectHeader, SignedData};
