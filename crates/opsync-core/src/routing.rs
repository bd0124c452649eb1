//! Keyspace distance, custody bounds and the known-contact table.
//!
//! ```text
//! custody bounds of owner O with K = 3
//!
//!   O ──●──────●────●──────────────●─────●──▶ distance(O, id)
//!       p1     p2   p3 (radius)    p4    p5
//!
//!   in_bounds(p2, radius, O) == true
//!   in_bounds(p4, radius, O) == false
//! ```
//!
//! Bounds are computed over the known contacts plus the local node, so the
//! local node is in an owner's cache area exactly when it is one of the K
//! nearest nodes it knows of.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::types::NodeId;

/// XOR distance between two ids
pub fn distance(a: NodeId, b: NodeId) -> u64 {
    a.0 ^ b.0
}

/// True if `id` lies within `bound` of `target`
pub fn in_bounds(id: NodeId, bound: u64, target: NodeId) -> bool {
    distance(id, target) <= bound
}

/// Radius around `owner` enclosing the `k` nearest of `peers`.
///
/// With fewer than `k` peers every id is in bounds.
pub fn recalc_bounds(owner: NodeId, peers: impl IntoIterator<Item = NodeId>, k: usize) -> u64 {
    let mut distances: Vec<u64> = peers.into_iter().map(|p| distance(owner, p)).collect();
    if k == 0 || distances.len() < k {
        return u64::MAX;
    }
    distances.sort_unstable();
    distances.dedup();
    if distances.len() < k {
        return u64::MAX;
    }
    distances[k - 1]
}

/// A peer the node has heard from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Contact {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub last_seen: Instant,
    /// Answered at least one of our pings
    pub responsive: bool,
}

/// Result of touching a contact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactUpdate {
    /// First time this id was seen
    Added,
    /// Already known; last-seen refreshed
    Refreshed,
}

/// Known contacts with cached per-owner custody bounds
#[derive(Debug)]
pub struct RoutingTable {
    local_id: NodeId,
    custody_size: usize,
    contacts: HashMap<NodeId, Contact>,
    bounds: HashMap<NodeId, u64>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId, custody_size: usize) -> Self {
        Self {
            local_id,
            custody_size,
            contacts: HashMap::new(),
            bounds: HashMap::new(),
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn custody_size(&self) -> usize {
        self.custody_size
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    /// Record traffic from a contact. Adding a new id invalidates cached bounds.
    pub fn touch(&mut self, id: NodeId, addr: SocketAddr, now: Instant) -> ContactUpdate {
        if id == self.local_id {
            return ContactUpdate::Refreshed;
        }
        match self.contacts.get_mut(&id) {
            Some(contact) => {
                contact.addr = addr;
                contact.last_seen = now;
                ContactUpdate::Refreshed
            }
            None => {
                self.contacts.insert(
                    id,
                    Contact {
                        id,
                        addr,
                        last_seen: now,
                        responsive: false,
                    },
                );
                self.bounds.clear();
                ContactUpdate::Added
            }
        }
    }

    /// Record that a contact answered a ping; returns true the first time.
    pub fn mark_responsive(&mut self, id: NodeId) -> bool {
        match self.contacts.get_mut(&id) {
            Some(contact) if !contact.responsive => {
                contact.responsive = true;
                true
            }
            _ => false,
        }
    }

    /// True if some contact has completed a round trip with us
    pub fn any_responsive(&self) -> bool {
        self.contacts.values().any(|c| c.responsive)
    }

    pub fn remove(&mut self, id: NodeId) -> Option<Contact> {
        let removed = self.contacts.remove(&id);
        if removed.is_some() {
            self.bounds.clear();
        }
        removed
    }

    pub fn get(&self, id: NodeId) -> Option<&Contact> {
        self.contacts.get(&id)
    }

    /// Look up the contact at an address
    pub fn by_addr(&self, addr: SocketAddr) -> Option<&Contact> {
        self.contacts.values().find(|c| c.addr == addr)
    }

    pub fn contacts(&self) -> impl Iterator<Item = &Contact> {
        self.contacts.values()
    }

    /// The `n` contacts nearest to `target`, nearest first
    pub fn closest(&self, target: NodeId, n: usize) -> Vec<Contact> {
        let mut all: Vec<Contact> = self.contacts.values().copied().collect();
        all.sort_by_key(|c| (distance(c.id, target), c.id));
        all.truncate(n);
        all
    }

    /// Custody radius around `owner`, over contacts plus the local node
    pub fn bounds(&mut self, owner: NodeId) -> u64 {
        if let Some(bound) = self.bounds.get(&owner) {
            return *bound;
        }
        let peers = self
            .contacts
            .keys()
            .copied()
            .chain(std::iter::once(self.local_id));
        let bound = recalc_bounds(owner, peers, self.custody_size);
        self.bounds.insert(owner, bound);
        bound
    }

    /// True if the local node is among the custodians of `owner`
    pub fn in_cache_area(&mut self, owner: NodeId) -> bool {
        let bound = self.bounds(owner);
        in_bounds(self.local_id, bound, owner)
    }

    /// True if `peer` is among the custodians of `owner`
    pub fn covers(&mut self, owner: NodeId, peer: NodeId) -> bool {
        let bound = self.bounds(owner);
        in_bounds(peer, bound, owner)
    }

    /// Drop contacts silent for longer than `timeout`; returns the removed ids.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<NodeId> {
        let expired: Vec<NodeId> = self
            .contacts
            .values()
            .filter(|c| now.saturating_duration_since(c.last_seen) > timeout)
            .map(|c| c.id)
            .collect();
        for id in &expired {
            self.contacts.remove(id);
        }
        if !expired.is_empty() {
            self.bounds.clear();
        }
        expired
    }
}
