//! Contracts for the components the store leans on but does not implement:
//! bulk file transfer and the trust hierarchy.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::types::{FileDetails, NodeId};

/// Identifies one download so its completion can be routed back
pub type DownloadTicket = u64;

/// A download handed to the transfer component
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub owner: NodeId,
    pub details: FileDetails,
    /// Where the finished file must end up
    pub dest: PathBuf,
    pub ticket: DownloadTicket,
}

/// Bulk file transfer.
///
/// `start_download` returns at once; completion is reported back to the
/// core loop through `Node::download_complete` (or
/// `ObjectStore::download_complete` when driving a store directly).
pub trait Transfers: Send + Sync {
    fn start_download(&self, request: DownloadRequest);
}

/// Which peers care about an owner, independent of keyspace distance
pub trait TrustLinks: Send + Sync {
    /// Peers in `owner`'s region of the hierarchy for `scope`
    fn region_members(&self, owner: NodeId, scope: u32) -> Vec<NodeId>;

    /// True if `id` is linked into the local node's hierarchy
    fn in_hierarchy(&self, id: NodeId) -> bool;
}

/// Transfers that never complete; payloads only arrive through local publish
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTransfers;

impl Transfers for NullTransfers {
    fn start_download(&self, request: DownloadRequest) {
        warn!(
            owner = %request.owner,
            size = request.details.size,
            "no transfer component configured, payload download dropped"
        );
    }
}

/// Records download requests for an external driver to fulfil.
#[derive(Debug, Default, Clone)]
pub struct TransferQueue {
    requests: Arc<Mutex<Vec<DownloadRequest>>>,
}

impl TransferQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every request queued so far.
    pub fn drain(&self) -> Vec<DownloadRequest> {
        std::mem::take(&mut *self.requests.lock())
    }

    pub fn len(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.lock().is_empty()
    }
}

impl Transfers for TransferQueue {
    fn start_download(&self, request: DownloadRequest) {
        self.requests.lock().push(request);
    }
}

/// No trust hierarchy: nobody is linked
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTrust;

impl TrustLinks for NoTrust {
    fn region_members(&self, _owner: NodeId, _scope: u32) -> Vec<NodeId> {
        Vec::new()
    }

    fn in_hierarchy(&self, _id: NodeId) -> bool {
        false
    }
}

/// A flat hierarchy: a fixed set of linked peers, the same for every scope
#[derive(Debug, Default, Clone)]
pub struct StaticTrust {
    members: HashSet<NodeId>,
}

impl StaticTrust {
    pub fn new(members: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            members: members.into_iter().collect(),
        }
    }
}

impl TrustLinks for StaticTrust {
    fn region_members(&self, owner: NodeId, _scope: u32) -> Vec<NodeId> {
        if self.members.contains(&owner) {
            let mut members: Vec<NodeId> = self.members.iter().copied().collect();
            members.sort();
            members
        } else {
            Vec::new()
        }
    }

    fn in_hierarchy(&self, id: NodeId) -> bool {
        self.members.contains(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ServiceTag;

    #[test]
    fn test_transfer_queue_drains() {
        let queue = TransferQueue::new();
        let shared: Arc<dyn Transfers> = Arc::new(queue.clone());
        shared.start_download(DownloadRequest {
            owner: NodeId(1),
            details: FileDetails {
                service: ServiceTag::BOARD,
                hash: [0u8; 32],
                size: 3,
                extra: vec![],
            },
            dest: PathBuf::from("/tmp/x"),
            ticket: 1,
        });
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.drain()[0].ticket, 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_static_trust_membership() {
        let trust = StaticTrust::new([NodeId(5), NodeId(3)]);
        assert!(trust.in_hierarchy(NodeId(5)));
        assert!(!trust.in_hierarchy(NodeId(4)));
        assert_eq!(trust.region_members(NodeId(3), 0), vec![NodeId(3), NodeId(5)]);
        assert!(trust.region_members(NodeId(9), 0).is_empty());
    }
}
