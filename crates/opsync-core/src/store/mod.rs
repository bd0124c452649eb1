//! Store / replicate / patch / search dispatch.
//!
//! The [`ObjectStore`] owns the [`StoreContext`] and the registered
//! services as disjoint fields, so a service can be borrowed mutably at the
//! same time as the context it works against.
//!
//! ```text
//!             ┌─────────── ObjectStore ────────────┐
//!  Inbound ──▶│ verify ─▶ services[tag].on_store   │
//!             │ digest ─▶ services[tag].on_patch   │──▶ outbox ──▶ transport
//!  tick ─────▶│ search ─▶ services[tag].on_search_*│
//!             └────────────────────────────────────┘
//! ```
//!
//! The network counts as established once some contact has answered one of
//! our pings and a lookup of our own id has run to completion.

mod context;
mod service;

pub use context::StoreContext;
pub use service::Service;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Instant;

use tracing::{debug, info, trace, warn};

use crate::collaborators::DownloadTicket;
use crate::digest::{self, PatchEntry};
use crate::error::{OpError, OpResult};
use crate::protocol::{ContactInfo, Message, Outbound, Packet, SearchId};
use crate::routing::ContactUpdate;
use crate::types::{FileDetails, NodeId, ServiceTag};
use crate::versioned::SignedData;

/// Bytes of digest carried per Patch packet, leaving room for framing and AEAD overhead
const PATCH_BUDGET: usize = 1200;

/// Bytes of search results carried per ack
const RESULT_BUDGET: usize = 1100;

/// Contacts returned in a search ack
const CLOSER_CONTACTS: usize = 8;

/// Progress of the lookup of our own id that completes joining
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lookup {
    Idle,
    Running(SearchId),
    Done,
}

pub struct ObjectStore {
    ctx: StoreContext,
    services: BTreeMap<ServiceTag, Box<dyn Service>>,
    last_keepalive: Option<Instant>,
    lookup: Lookup,
}

impl ObjectStore {
    pub fn new(ctx: StoreContext) -> Self {
        Self {
            ctx,
            services: BTreeMap::new(),
            last_keepalive: None,
            lookup: Lookup::Idle,
        }
    }

    pub fn register(&mut self, service: Box<dyn Service>) {
        let tag = service.tag();
        if self.services.insert(tag, service).is_some() {
            warn!(%tag, "service registered twice, replacing");
        }
    }

    pub fn context(&self) -> &StoreContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut StoreContext {
        &mut self.ctx
    }

    pub fn local_id(&self) -> NodeId {
        self.ctx.local_id()
    }

    pub fn service<T: Service>(&self, tag: ServiceTag) -> Option<&T> {
        self.services.get(&tag)?.as_any().downcast_ref::<T>()
    }

    /// Borrow a registered service together with the context it runs against.
    pub fn service_mut<T: Service>(
        &mut self,
        tag: ServiceTag,
    ) -> Option<(&mut T, &mut StoreContext)> {
        let service = self.services.get_mut(&tag)?.as_any_mut().downcast_mut::<T>()?;
        Some((service, &mut self.ctx))
    }

    pub fn drain_outbox(&mut self) -> Vec<Outbound> {
        self.ctx.drain_outbox()
    }

    /// Say hello to a peer whose id is not known yet.
    pub fn bootstrap(&mut self, addr: SocketAddr) {
        info!(%addr, "pinging bootstrap peer");
        self.ctx.send(Outbound {
            addr,
            dest: None,
            packet: Packet::Ping,
        });
    }

    /// Handle one decoded datagram.
    pub fn handle_message(&mut self, addr: SocketAddr, message: Message, now: Instant) {
        self.ctx.set_now(now);
        let source = ContactInfo {
            id: message.sender,
            addr,
        };
        if source.id == self.ctx.local_id() {
            trace!(%addr, "ignoring packet claiming our own id");
            return;
        }

        let update = self.ctx.routing.touch(source.id, addr, now);
        if update == ContactUpdate::Added {
            debug!(peer = %source.id, %addr, "new contact");
            self.replicate(source);
            if message.packet != Packet::Pong {
                self.ctx.send_to(source, Packet::Ping);
            }
        }

        match message.packet {
            Packet::Ping => self.ctx.send(Outbound {
                addr,
                dest: Some(source.id),
                packet: Packet::Pong,
            }),
            Packet::Pong => {
                if self.ctx.routing.mark_responsive(source.id) {
                    trace!(peer = %source.id, "contact answered a ping");
                }
            }
            Packet::Store { service, data } => {
                if let Err(err) = self.store(Some(source), service, &data) {
                    warn!(peer = %source.id, %service, error = %err, "store rejected");
                }
            }
            Packet::Patch { digests } => {
                for (service, bytes) in digests {
                    if let Err(err) = self.patch(source, service, &bytes) {
                        warn!(peer = %source.id, %service, error = %err, "patch dropped");
                    }
                }
            }
            Packet::SearchReq {
                search_id,
                target,
                service,
                params,
            } => self.answer_search(source, search_id, target, service, &params),
            Packet::SearchAck {
                search_id,
                service: _,
                results,
                closer,
            } => self.search_ack(source, search_id, results, closer),
        }
        self.refresh_status();
    }

    /// Verify a signed envelope and hand it to its service.
    ///
    /// Nothing is mutated unless the signature checks out against the owner.
    pub fn store(
        &mut self,
        source: Option<ContactInfo>,
        tag: ServiceTag,
        data: &[u8],
    ) -> OpResult<()> {
        let signed = SignedData::decode(data)?;
        let header = signed.verify()?;
        if header.service != tag {
            return Err(OpError::MalformedPacket(format!(
                "header for {} delivered as {}",
                header.service, tag
            )));
        }
        let service = self
            .services
            .get_mut(&tag)
            .ok_or(OpError::UnknownService(tag.0))?;
        if header.key.len() != service.key_width() {
            return Err(OpError::MalformedPacket(format!(
                "{} key is {} bytes, expected {}",
                tag,
                header.key.len(),
                service.key_width()
            )));
        }
        service.on_store(&mut self.ctx, source, signed, header);
        Ok(())
    }

    /// Send `contact` digests of everything it should now hold, one digest per service.
    pub fn replicate(&mut self, contact: ContactInfo) {
        let mut digests: Vec<(ServiceTag, Vec<u8>)> = Vec::new();
        for (tag, service) in self.services.iter_mut() {
            let entries = service.on_replicate(&mut self.ctx, contact);
            if entries.is_empty() {
                continue;
            }
            let width = service.key_width();
            let per_packet = (PATCH_BUDGET / digest::entry_size(width)).max(1);
            for chunk in entries.chunks(per_packet) {
                match digest::encode(chunk, width) {
                    Ok(bytes) => digests.push((*tag, bytes)),
                    Err(err) => warn!(service = %tag, error = %err, "skipping digest"),
                }
            }
        }
        if digests.is_empty() {
            return;
        }

        let mut packet: Vec<(ServiceTag, Vec<u8>)> = Vec::new();
        let mut size = 0;
        for (tag, bytes) in digests {
            if size + bytes.len() > PATCH_BUDGET && !packet.is_empty() {
                self.ctx.send_to(
                    contact,
                    Packet::Patch {
                        digests: std::mem::take(&mut packet),
                    },
                );
                size = 0;
            }
            size += bytes.len();
            packet.push((tag, bytes));
        }
        self.ctx.send_to(contact, Packet::Patch { digests: packet });
    }

    /// Reconcile a digest from `source`.
    ///
    /// A digest with a ragged length is dropped wholesale. Entries whose
    /// owner is outside local bounds are skipped before the service sees them.
    pub fn patch(&mut self, source: ContactInfo, tag: ServiceTag, bytes: &[u8]) -> OpResult<()> {
        let service = self
            .services
            .get(&tag)
            .ok_or(OpError::UnknownService(tag.0))?;
        let mut entries: Vec<PatchEntry> = digest::decode(bytes, service.key_width())?;
        let ctx = &mut self.ctx;
        entries.retain(|e| ctx.in_cache_area(e.owner) || service.retains_owner(ctx, e.owner));
        if entries.is_empty() {
            return Ok(());
        }
        if let Some(service) = self.services.get_mut(&tag) {
            service.on_patch(&mut self.ctx, source, entries);
        }
        Ok(())
    }

    fn answer_search(
        &mut self,
        source: ContactInfo,
        search_id: SearchId,
        target: NodeId,
        tag: ServiceTag,
        params: &[u8],
    ) {
        let results = match self.services.get_mut(&tag) {
            Some(service) => service.on_search_local(&mut self.ctx, target, params),
            None if tag == ServiceTag::ROUTING => Vec::new(),
            None => {
                debug!(service = %tag, "search for unknown service");
                Vec::new()
            }
        };

        let mut size = 0;
        let results: Vec<Vec<u8>> = results
            .into_iter()
            .take_while(|r| {
                size += r.len() + 2;
                size <= RESULT_BUDGET
            })
            .collect();

        let closer = self
            .ctx
            .routing
            .closest(target, CLOSER_CONTACTS)
            .into_iter()
            .filter(|c| c.id != source.id)
            .map(|c| ContactInfo {
                id: c.id,
                addr: c.addr,
            })
            .collect();

        self.ctx.send_to(
            source,
            Packet::SearchAck {
                search_id,
                service: tag,
                results,
                closer,
            },
        );
    }

    fn search_ack(
        &mut self,
        source: ContactInfo,
        search_id: SearchId,
        results: Vec<Vec<u8>>,
        closer: Vec<ContactInfo>,
    ) {
        let (hit, follow_up) = self.ctx.searches.on_ack(source, search_id, results, closer);
        for outbound in follow_up {
            self.ctx.send(outbound);
        }
        if let Some(hit) = hit {
            match self.services.get_mut(&hit.service) {
                Some(service) => service.on_search_result(&mut self.ctx, hit),
                None => debug!(service = %hit.service, "search result for unknown service"),
            }
        }
    }

    /// Advance the join state and tell every service when it flips.
    fn refresh_status(&mut self) {
        if !self.ctx.routing.any_responsive() {
            self.lookup = Lookup::Idle;
        }
        if self.lookup == Lookup::Idle && self.ctx.routing.any_responsive() {
            let local = self.ctx.local_id();
            let id = self.ctx.start_search(local, ServiceTag::ROUTING, Vec::new(), 1);
            debug!(search_id = id, "looking up own id");
            self.lookup = Lookup::Running(id);
        }
        if let Lookup::Running(id) = self.lookup {
            if !self.ctx.searches.is_live(id) {
                self.lookup = Lookup::Done;
            }
        }

        let established = self.lookup == Lookup::Done;
        if established == self.ctx.is_established() {
            return;
        }
        self.ctx.set_established(established);
        info!(established, contacts = self.ctx.routing.len(), "network status changed");
        for service in self.services.values_mut() {
            service.on_status_change(&mut self.ctx, established);
        }
    }

    /// Periodic maintenance.
    pub fn tick(&mut self, now: Instant) {
        self.ctx.set_now(now);

        let timeout = self.ctx.config().contact_timeout();
        let expired = self.ctx.routing.expire(now, timeout);
        if !expired.is_empty() {
            debug!(count = expired.len(), "expired silent contacts");
        }
        self.ctx.searches.tick(now);
        self.refresh_status();

        let keepalive_due = self
            .last_keepalive
            .map(|last| now.saturating_duration_since(last) >= timeout / 3)
            .unwrap_or(true);
        if keepalive_due {
            self.last_keepalive = Some(now);
            let contacts: Vec<ContactInfo> = self
                .ctx
                .routing
                .contacts()
                .map(|c| ContactInfo {
                    id: c.id,
                    addr: c.addr,
                })
                .collect();
            for contact in contacts {
                self.ctx.send_to(contact, Packet::Ping);
            }
        }

        for service in self.services.values_mut() {
            service.on_tick(&mut self.ctx);
        }
    }

    pub fn download_complete(
        &mut self,
        tag: ServiceTag,
        ticket: DownloadTicket,
        result: OpResult<()>,
    ) {
        match self.services.get_mut(&tag) {
            Some(service) => service.on_download_complete(&mut self.ctx, ticket, result),
            None => warn!(service = %tag, ticket, "download finished for unknown service"),
        }
    }

    pub fn file_search(&self, owner: NodeId, details: &FileDetails) -> bool {
        self.services
            .get(&details.service)
            .map(|s| s.file_search(owner, details))
            .unwrap_or(false)
    }

    pub fn file_request(&self, owner: NodeId, details: &FileDetails) -> Option<PathBuf> {
        self.services
            .get(&details.service)?
            .file_request(owner, details)
    }
}
