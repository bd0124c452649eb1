//! Iterative targeted lookups.
//!
//! A search walks toward its target id: it queries the `alpha` closest known
//! contacts, and every ack may name contacts closer still, which are queried
//! next. Results are handed to the owning service until the requested count
//! is reached, the candidates run out or the search times out. Once removed,
//! late acks for it are dropped.
//!
//! ```text
//!  start ──▶ query α closest ──▶ ack ──▶ deliver results ──▶ enough? ──▶ done
//!                  ▲                │
//!                  └── closer ◀─────┘      tick: started + timeout < now ──▶ done
//! ```

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::protocol::{ContactInfo, Outbound, Packet, SearchId};
use crate::routing::{distance, RoutingTable};
use crate::types::{NodeId, ServiceTag};

/// Results handed to a service for one ack
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub search_id: SearchId,
    pub service: ServiceTag,
    pub target: NodeId,
    pub params: Vec<u8>,
    pub source: ContactInfo,
    pub results: Vec<Vec<u8>>,
}

/// A live search
#[derive(Debug)]
struct Search {
    target: NodeId,
    service: ServiceTag,
    params: Vec<u8>,
    target_results: usize,
    found: usize,
    started: Instant,
    queried: HashSet<NodeId>,
    /// Unqueried contacts, kept sorted nearest-first
    candidates: Vec<ContactInfo>,
    outstanding: usize,
    /// Single round trip; closer contacts are not followed
    direct: bool,
}

impl Search {
    fn add_candidate(&mut self, contact: ContactInfo) {
        if self.queried.contains(&contact.id) || self.candidates.iter().any(|c| c.id == contact.id)
        {
            return;
        }
        let target = self.target;
        let pos = self
            .candidates
            .partition_point(|c| distance(c.id, target) < distance(contact.id, target));
        self.candidates.insert(pos, contact);
    }

    fn next_queries(&mut self, id: SearchId, alpha: usize, out: &mut Vec<Outbound>) {
        while self.outstanding < alpha && !self.candidates.is_empty() {
            let contact = self.candidates.remove(0);
            self.queried.insert(contact.id);
            self.outstanding += 1;
            out.push(request(id, contact, self.target, self.service, &self.params));
        }
    }

    fn exhausted(&self) -> bool {
        self.outstanding == 0 && self.candidates.is_empty()
    }
}

fn request(
    search_id: SearchId,
    contact: ContactInfo,
    target: NodeId,
    service: ServiceTag,
    params: &[u8],
) -> Outbound {
    Outbound {
        addr: contact.addr,
        dest: Some(contact.id),
        packet: Packet::SearchReq {
            search_id,
            target,
            service,
            params: params.to_vec(),
        },
    }
}

/// Live request table for every search this node issued
#[derive(Debug)]
pub struct SearchCoordinator {
    local_id: NodeId,
    alpha: usize,
    timeout: Duration,
    next_id: SearchId,
    searches: HashMap<SearchId, Search>,
}

impl SearchCoordinator {
    pub fn new(local_id: NodeId, alpha: usize, timeout: Duration) -> Self {
        Self {
            local_id,
            alpha: alpha.max(1),
            timeout,
            next_id: 0,
            searches: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.searches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.searches.is_empty()
    }

    pub fn is_live(&self, id: SearchId) -> bool {
        self.searches.contains_key(&id)
    }

    fn allocate(&mut self) -> SearchId {
        self.next_id = self.next_id.wrapping_add(1);
        self.next_id
    }

    /// Begin an iterative search; returns its id and the first wave of requests.
    ///
    /// With no contacts to ask the search finishes immediately.
    pub fn start(
        &mut self,
        routing: &RoutingTable,
        target: NodeId,
        service: ServiceTag,
        params: Vec<u8>,
        target_results: usize,
        now: Instant,
    ) -> (SearchId, Vec<Outbound>) {
        let id = self.allocate();
        let mut search = Search {
            target,
            service,
            params,
            target_results: target_results.max(1),
            found: 0,
            started: now,
            queried: HashSet::new(),
            candidates: Vec::new(),
            outstanding: 0,
            direct: false,
        };
        for contact in routing.closest(target, self.alpha * 2) {
            search.add_candidate(ContactInfo {
                id: contact.id,
                addr: contact.addr,
            });
        }

        let mut out = Vec::new();
        search.next_queries(id, self.alpha, &mut out);
        if out.is_empty() {
            debug!(search_id = id, %target, %service, "search has no contacts to ask");
        } else {
            debug!(search_id = id, %target, %service, queries = out.len(), "search started");
            self.searches.insert(id, search);
        }
        (id, out)
    }

    /// One round trip to a known peer, no iteration.
    pub fn send_direct_request(
        &mut self,
        addr: SocketAddr,
        dest: NodeId,
        target: NodeId,
        service: ServiceTag,
        params: Vec<u8>,
        now: Instant,
    ) -> (SearchId, Outbound) {
        let id = self.allocate();
        let contact = ContactInfo { id: dest, addr };
        let mut search = Search {
            target,
            service,
            params,
            target_results: usize::MAX,
            found: 0,
            started: now,
            queried: HashSet::new(),
            candidates: Vec::new(),
            outstanding: 1,
            direct: true,
        };
        search.queried.insert(dest);
        let outbound = request(id, contact, target, service, &search.params);
        self.searches.insert(id, search);
        (id, outbound)
    }

    /// Process an ack. Returns the hit to deliver (if the search is still
    /// live) and any follow-up requests.
    pub fn on_ack(
        &mut self,
        source: ContactInfo,
        search_id: SearchId,
        mut results: Vec<Vec<u8>>,
        closer: Vec<ContactInfo>,
    ) -> (Option<SearchHit>, Vec<Outbound>) {
        let Some(search) = self.searches.get_mut(&search_id) else {
            trace!(search_id, from = %source.id, "dropping ack for finished search");
            return (None, Vec::new());
        };
        if !search.queried.contains(&source.id) {
            trace!(search_id, from = %source.id, "dropping ack from unqueried contact");
            return (None, Vec::new());
        }
        search.outstanding = search.outstanding.saturating_sub(1);

        let remaining = search.target_results - search.found;
        results.truncate(remaining);
        search.found += results.len();

        let hit = (!results.is_empty()).then(|| SearchHit {
            search_id,
            service: search.service,
            target: search.target,
            params: search.params.clone(),
            source,
            results,
        });

        let mut out = Vec::new();
        let done = search.found >= search.target_results;
        if !done && !search.direct {
            for contact in closer {
                if contact.id != self.local_id {
                    search.add_candidate(contact);
                }
            }
            search.next_queries(search_id, self.alpha, &mut out);
        }
        if done || search.exhausted() {
            debug!(search_id, found = search.found, "search finished");
            self.searches.remove(&search_id);
        }
        (hit, out)
    }

    /// Drop searches older than the timeout; returns their ids.
    pub fn tick(&mut self, now: Instant) -> Vec<SearchId> {
        let timeout = self.timeout;
        let expired: Vec<SearchId> = self
            .searches
            .iter()
            .filter(|(_, s)| now.saturating_duration_since(s.started) >= timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.searches.remove(id);
            debug!(search_id = id, "search timed out");
        }
        expired
    }
}
