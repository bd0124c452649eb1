//! Shared state every service handler works against.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::collaborators::{DownloadRequest, DownloadTicket, Transfers, TrustLinks};
use crate::config::NodeConfig;
use crate::error::OpResult;
use crate::identity::NodeKeypair;
use crate::protocol::{ContactInfo, Outbound, Packet, SearchId};
use crate::routing::RoutingTable;
use crate::search::SearchCoordinator;
use crate::types::{FileDetails, NodeId, ServiceTag};
use crate::versioned::SignedData;

/// Routing, searches, outbox and collaborators, borrowed by services while
/// they handle an event.
///
/// Nothing here touches the socket: packets are queued in the outbox and the
/// owner of the store drains it.
pub struct StoreContext {
    keypair: NodeKeypair,
    local_id: NodeId,
    config: NodeConfig,
    file_key: [u8; 32],
    data_dir: PathBuf,
    pub routing: RoutingTable,
    pub searches: SearchCoordinator,
    outbox: Vec<Outbound>,
    established: bool,
    trust: Arc<dyn TrustLinks>,
    transfers: Arc<dyn Transfers>,
    now: Instant,
    next_ticket: DownloadTicket,
}

impl StoreContext {
    pub fn new(
        keypair: NodeKeypair,
        config: NodeConfig,
        file_key: [u8; 32],
        data_dir: impl Into<PathBuf>,
        trust: Arc<dyn TrustLinks>,
        transfers: Arc<dyn Transfers>,
    ) -> Self {
        let local_id = keypair.node_id();
        Self {
            routing: RoutingTable::new(local_id, config.custody_size),
            searches: SearchCoordinator::new(
                local_id,
                config.search_alpha,
                config.search_timeout(),
            ),
            keypair,
            local_id,
            config,
            file_key,
            data_dir: data_dir.into(),
            outbox: Vec::new(),
            established: false,
            trust,
            transfers,
            now: Instant::now(),
            next_ticket: 0,
        }
    }

    pub fn keypair(&self) -> &NodeKeypair {
        &self.keypair
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Node-local key for files at rest
    pub fn file_key(&self) -> &[u8; 32] {
        &self.file_key
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Root directory for one service's files
    pub fn service_dir(&self, tag: ServiceTag) -> PathBuf {
        self.data_dir.join("services").join(tag.0.to_string())
    }

    pub fn trust(&self) -> &dyn TrustLinks {
        self.trust.as_ref()
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    pub(crate) fn set_now(&mut self, now: Instant) {
        self.now = now;
    }

    pub fn is_established(&self) -> bool {
        self.established
    }

    pub(crate) fn set_established(&mut self, established: bool) {
        self.established = established;
    }

    pub fn in_cache_area(&mut self, owner: NodeId) -> bool {
        self.routing.in_cache_area(owner)
    }

    /// Queue a packet for sending.
    pub fn send(&mut self, outbound: Outbound) {
        self.outbox.push(outbound);
    }

    pub fn send_to(&mut self, contact: ContactInfo, packet: Packet) {
        self.send(Outbound {
            addr: contact.addr,
            dest: Some(contact.id),
            packet,
        });
    }

    /// Take everything queued since the last drain.
    pub fn drain_outbox(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    pub fn send_store(
        &mut self,
        contact: ContactInfo,
        service: ServiceTag,
        signed: &SignedData,
    ) -> OpResult<()> {
        let data = signed.encode()?;
        self.send_to(contact, Packet::Store { service, data });
        Ok(())
    }

    /// Push a signed object to the custody set of `owner`; returns how many peers it went to.
    pub fn publish_network(
        &mut self,
        owner: NodeId,
        service: ServiceTag,
        signed: &SignedData,
    ) -> OpResult<usize> {
        let custodians = self.routing.closest(owner, self.config.custody_size);
        let data = signed.encode()?;
        for contact in &custodians {
            self.send(Outbound {
                addr: contact.addr,
                dest: Some(contact.id),
                packet: Packet::Store {
                    service,
                    data: data.clone(),
                },
            });
        }
        debug!(%owner, %service, peers = custodians.len(), "published to custody set");
        Ok(custodians.len())
    }

    pub fn publish_direct(
        &mut self,
        contacts: &[ContactInfo],
        service: ServiceTag,
        signed: &SignedData,
    ) -> OpResult<()> {
        for contact in contacts {
            self.send_store(*contact, service, signed)?;
        }
        Ok(())
    }

    pub fn start_search(
        &mut self,
        target: NodeId,
        service: ServiceTag,
        params: Vec<u8>,
        target_results: usize,
    ) -> SearchId {
        let (id, out) = self.searches.start(
            &self.routing,
            target,
            service,
            params,
            target_results,
            self.now,
        );
        self.outbox.extend(out);
        id
    }

    pub fn send_direct_request(
        &mut self,
        source: ContactInfo,
        target: NodeId,
        service: ServiceTag,
        params: Vec<u8>,
    ) -> SearchId {
        let (id, out) = self.searches.send_direct_request(
            source.addr,
            source.id,
            target,
            service,
            params,
            self.now,
        );
        self.outbox.push(out);
        id
    }

    /// Ask the transfer component for a payload file.
    pub fn start_download(
        &mut self,
        owner: NodeId,
        details: FileDetails,
        dest: PathBuf,
    ) -> DownloadTicket {
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        debug!(%owner, ticket, size = details.size, "starting payload download");
        self.transfers.start_download(DownloadRequest {
            owner,
            details,
            dest,
            ticket,
        });
        ticket
    }
}
