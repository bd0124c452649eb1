//! Fetches deferred while the network is down, and eviction ordering.

use std::collections::{BTreeMap, HashMap};

use crate::digest::PatchEntry;
use crate::routing::distance;
use crate::types::{NodeId, ObjectKey, Version};

/// Objects to fetch once connected, deduplicated per owner and key.
#[derive(Debug, Default)]
pub struct PendingDownloads {
    owners: HashMap<NodeId, BTreeMap<ObjectKey, Version>>,
}

impl PendingDownloads {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of owners with something pending
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    /// Queue `entry`, keeping only the highest version per key.
    ///
    /// Returns false if an equal or newer version was already queued.
    pub fn add(&mut self, entry: PatchEntry) -> bool {
        let keys = self.owners.entry(entry.owner).or_default();
        match keys.get(&entry.key) {
            Some(queued) if *queued >= entry.version => false,
            _ => {
                keys.insert(entry.key, entry.version);
                true
            }
        }
    }

    /// Forget anything queued for `key` at or below `version`.
    pub fn satisfied(&mut self, owner: NodeId, key: &ObjectKey, version: Version) {
        if let Some(keys) = self.owners.get_mut(&owner) {
            if keys.get(key).is_some_and(|queued| *queued <= version) {
                keys.remove(key);
            }
            if keys.is_empty() {
                self.owners.remove(&owner);
            }
        }
    }

    /// Keep at most `max_owners`, dropping those farthest from `local` first.
    pub fn prune(&mut self, local: NodeId, max_owners: usize) -> usize {
        if self.owners.len() <= max_owners {
            return 0;
        }
        let owners: Vec<NodeId> = self.owners.keys().copied().collect();
        let drop = farthest_first(local, owners, self.owners.len() - max_owners);
        for owner in &drop {
            self.owners.remove(owner);
        }
        drop.len()
    }

    /// Take everything queued.
    pub fn drain(&mut self) -> Vec<PatchEntry> {
        let mut out = Vec::new();
        for (owner, keys) in self.owners.drain() {
            for (key, version) in keys {
                out.push(PatchEntry::new(owner, key, version));
            }
        }
        out
    }
}

/// The `count` ids of `candidates` farthest from `local`, farthest first.
pub fn farthest_first(local: NodeId, mut candidates: Vec<NodeId>, count: usize) -> Vec<NodeId> {
    candidates.sort_by_key(|id| std::cmp::Reverse((distance(local, *id), *id)));
    candidates.truncate(count);
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(owner: u64, key: u8, version: Version) -> PatchEntry {
        PatchEntry::new(NodeId(owner), ObjectKey(vec![key; 8]), version)
    }

    #[test]
    fn test_add_deduplicates() {
        let mut pending = PendingDownloads::new();
        assert!(pending.add(entry(1, 1, 3)));
        assert!(!pending.add(entry(1, 1, 3)));
        assert!(!pending.add(entry(1, 1, 2)));
        assert!(pending.add(entry(1, 1, 4)));
        assert_eq!(pending.drain(), vec![entry(1, 1, 4)]);
    }

    #[test]
    fn test_satisfied_clears_owner() {
        let mut pending = PendingDownloads::new();
        pending.add(entry(1, 1, 3));
        pending.satisfied(NodeId(1), &ObjectKey(vec![1; 8]), 2);
        assert_eq!(pending.len(), 1);
        pending.satisfied(NodeId(1), &ObjectKey(vec![1; 8]), 3);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_prune_drops_farthest() {
        let mut pending = PendingDownloads::new();
        for owner in [1u64, 2, 64, 128] {
            pending.add(entry(owner, 0, 1));
        }
        assert_eq!(pending.prune(NodeId(0), 2), 2);
        let mut left: Vec<NodeId> = pending.drain().into_iter().map(|e| e.owner).collect();
        left.sort();
        assert_eq!(left, vec![NodeId(1), NodeId(2)]);
    }

    #[test]
    fn test_farthest_first_order() {
        let order = farthest_first(NodeId(0), vec![NodeId(3), NodeId(9), NodeId(5)], 3);
        assert_eq!(order, vec![NodeId(9), NodeId(5), NodeId(3)]);
    }
}
