//! Generic per-service cache engine.
//!
//! A [`ServiceCache`] holds every object of one service the node keeps:
//! its own, those of owners whose custody bounds include the node, and
//! those pinned by the trust hierarchy or an open view. The service itself
//! only describes its keys, bodies and searches through [`CacheSpec`].
//!
//! ## Version handling
//!
//! ```text
//! incoming v  vs  cached c
//!   v <  c   push c back to the sender, no local change
//!   v == c   mark confirmed
//!   v >  c   replace, delete c's payload file, fetch v's payload
//!
//! A digest entry at or above the cached version also marks the object
//! confirmed; a newer one is fetched as well.
//! ```
//!
//! ## Persistence
//!
//! Mutations only mark an owner dirty; the tick flushes dirty owners every
//! `save_interval`. Local publishes are the exception and save at once.

mod disk;
mod index;
mod pending;

pub use disk::CacheDisk;
pub use index::{CacheIndex, CachedObject, UniqueState};
pub use pending::{farthest_first, PendingDownloads};

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::collaborators::DownloadTicket;
use crate::crypto::ObjectCrypto;
use crate::digest::PatchEntry;
use crate::error::{OpError, OpResult};
use crate::protocol::ContactInfo;
use crate::search::SearchHit;
use crate::store::{Service, StoreContext};
use crate::types::{FileDetails, NodeId, ObjectKey, PayloadRef, ServiceTag, Version};
use crate::versioned::{file, ObjectHeader, SignedData};

/// What a service tells the cache engine about its objects.
pub trait CacheSpec: Sized + Send + Sync + 'static {
    /// Parsed payload kept in memory while the owner is warm
    type Detail: Clone + Send + Sync + 'static;
    /// Secondary index maintained on every insert and removal
    type Index: Default + Send + Sync + 'static;
    /// Search parameters
    type Query: Serialize + DeserializeOwned;

    const TAG: ServiceTag;
    const KEY_WIDTH: usize;

    /// Check service fields of a verified header.
    fn validate(header: &ObjectHeader) -> OpResult<()>;

    fn parse_detail(plaintext: &[u8]) -> OpResult<Self::Detail>;

    fn index_insert(index: &mut Self::Index, header: &ObjectHeader);

    fn index_remove(index: &mut Self::Index, header: &ObjectHeader);

    /// Query that fetches one object at `version` or newer; the search target is its owner.
    fn object_query(key: &ObjectKey, version: Version) -> Self::Query;

    /// Objects answering `query` for a search aimed at `target`
    fn search(index: &CacheIndex<Self>, target: NodeId, query: &Self::Query) -> Vec<(NodeId, ObjectKey)>;

    /// Other owners whose custody sets also hold this object
    fn related_owners(_header: &ObjectHeader) -> Vec<NodeId> {
        Vec::new()
    }

    /// Hierarchy scope the object is addressed to, if any
    fn scope(_header: &ObjectHeader) -> Option<u32> {
        None
    }
}

/// A payload encrypted and hashed, ready to publish
#[derive(Debug, Clone)]
pub struct SealedPayload {
    pub object_key: [u8; 32],
    pub ciphertext: Vec<u8>,
    pub payload: PayloadRef,
}

impl SealedPayload {
    /// Encrypt `plaintext` under a fresh object key. CPU bound; run off the core loop.
    pub fn seal(plaintext: &[u8]) -> OpResult<Self> {
        let object_key = ObjectCrypto::generate_key();
        let (ciphertext, payload) = file::seal_payload(&object_key, plaintext)?;
        Ok(Self {
            object_key,
            ciphertext,
            payload,
        })
    }
}

/// Read handle for presentation code; the core loop is the only writer
pub type CacheReader<S> = Arc<RwLock<CacheIndex<S>>>;

/// A payload handed to the transfer component and not finished yet
#[derive(Debug, Clone)]
struct PayloadDownload {
    owner: NodeId,
    key: ObjectKey,
    version: Version,
    started: Instant,
}

pub struct ServiceCache<S: CacheSpec> {
    index: Arc<RwLock<CacheIndex<S>>>,
    disk: CacheDisk,
    dirty: HashSet<NodeId>,
    views: HashSet<NodeId>,
    pending: PendingDownloads,
    downloads: HashMap<DownloadTicket, PayloadDownload>,
    inflight: HashMap<(NodeId, ObjectKey), (Version, Instant)>,
    last_save: Instant,
}

impl<S: CacheSpec> ServiceCache<S> {
    pub fn new(ctx: &StoreContext) -> Self {
        Self {
            index: Arc::new(RwLock::new(CacheIndex::new())),
            disk: CacheDisk::new(ctx.service_dir(S::TAG), *ctx.file_key()),
            dirty: HashSet::new(),
            views: HashSet::new(),
            pending: PendingDownloads::new(),
            downloads: HashMap::new(),
            inflight: HashMap::new(),
            last_save: ctx.now(),
        }
    }

    pub fn reader(&self) -> CacheReader<S> {
        Arc::clone(&self.index)
    }

    pub fn disk(&self) -> &CacheDisk {
        &self.disk
    }

    pub fn pending(&self) -> &PendingDownloads {
        &self.pending
    }

    pub fn dirty_owners(&self) -> usize {
        self.dirty.len()
    }

    /// Payload downloads still waiting for completion
    pub fn downloads_in_progress(&self) -> usize {
        self.downloads.len()
    }

    pub fn unique(&self, owner: NodeId, key: &ObjectKey) -> Option<UniqueState> {
        self.index.read().get(owner, key).map(|o| o.unique)
    }

    pub fn version(&self, owner: NodeId, key: &ObjectKey) -> Option<Version> {
        self.index.read().version(owner, key)
    }

    /// Pin an owner in memory while something is looking at it.
    pub fn open_view(&mut self, owner: NodeId) {
        self.views.insert(owner);
    }

    pub fn close_view(&mut self, owner: NodeId) {
        self.views.remove(&owner);
    }

    /// Load the `prune_size` stored owners nearest the local id.
    pub fn load(&mut self, ctx: &StoreContext) -> OpResult<usize> {
        let local = ctx.local_id();
        let mut owners = self.disk.stored_owners()?;
        owners.sort_by_key(|owner| (crate::routing::distance(local, *owner), *owner));
        owners.truncate(ctx.config().prune_size);

        let mut loaded = 0;
        let mut index = self.index.write();
        for owner in owners {
            let headers = match self.disk.load_owner(owner) {
                Ok(headers) => headers,
                Err(err) => {
                    warn!(service = %S::TAG, %owner, error = %err, "skipping unreadable owner");
                    continue;
                }
            };
            for bytes in headers {
                match verified::<S>(&bytes) {
                    Ok((signed, header)) if header.owner == owner => {
                        let unique = if owner == local {
                            UniqueState::Announced
                        } else {
                            UniqueState::Confirmed
                        };
                        index.insert(CachedObject::new(signed, header, unique));
                        loaded += 1;
                    }
                    Ok(_) => warn!(service = %S::TAG, %owner, "stored header belongs to another owner"),
                    Err(err) => warn!(service = %S::TAG, %owner, error = %err, "dropping stored header"),
                }
            }
        }
        info!(service = %S::TAG, objects = loaded, owners = index.len(), "cache loaded");
        Ok(loaded)
    }

    /// Publish a locally authored header, signing it with the node key.
    ///
    /// The payload file is written and the owner saved before this returns.
    /// With the network up the object goes to its custody sets at once;
    /// otherwise it stays `Local` until the network comes back.
    pub fn publish(
        &mut self,
        ctx: &mut StoreContext,
        header: ObjectHeader,
        payload: Option<SealedPayload>,
    ) -> OpResult<()> {
        let owner = ctx.local_id();
        if header.owner != owner || header.service != S::TAG {
            return Err(OpError::Identity(format!(
                "cannot publish {} object of owner {}",
                header.service, header.owner
            )));
        }
        S::validate(&header)?;
        if let Some(current) = self.version(owner, &header.key) {
            if current >= header.version {
                return Err(OpError::VersionRegression {
                    owner,
                    remote: header.version,
                    local: current,
                });
            }
        }
        if let Some(sealed) = &payload {
            if header.payload != Some(sealed.payload) {
                return Err(OpError::PayloadMissing(
                    "header does not reference the sealed payload".to_string(),
                ));
            }
            let path = self.disk.payload_path(owner, &header.key, &sealed.payload);
            file::write_atomic(&path, &sealed.ciphertext)?;
        }

        let key = header.key.clone();
        let signed = SignedData::sign(ctx.keypair(), &header)?;
        self.install(ctx, signed, header, UniqueState::Local);
        self.flush_owner(owner)?;
        self.dirty.remove(&owner);
        if ctx.is_established() {
            self.announce(ctx, owner, &key)?;
        }
        Ok(())
    }

    /// Parsed payload of an object, loading it from disk if it was unloaded.
    pub fn detail(
        &mut self,
        ctx: &mut StoreContext,
        owner: NodeId,
        key: &ObjectKey,
    ) -> OpResult<Option<S::Detail>> {
        let header = {
            let index = self.index.read();
            let object = index
                .get(owner, key)
                .ok_or_else(|| OpError::NotFound(format!("{} {}", owner, key)))?;
            if let Some(detail) = &object.detail {
                return Ok(Some(detail.clone()));
            }
            object.header.clone()
        };
        let Some(payload) = header.payload else {
            return Ok(None);
        };
        let Some(object_key) = header.object_key(Some(ctx.keypair()))? else {
            return Ok(None);
        };
        let path = self.disk.payload_path(owner, key, &payload);
        if !path.exists() {
            if !self.downloads.values().any(|d| d.owner == owner && d.key == *key) {
                self.start_payload_download(ctx, &header, payload);
            }
            return Err(OpError::PayloadMissing(format!("{} {}", owner, key)));
        }
        let detail = S::parse_detail(&file::open_payload(&path, &object_key)?)?;
        if let Some(object) = self.index.write().get_mut(owner, key) {
            object.detail = Some(detail.clone());
        }
        Ok(Some(detail))
    }

    /// Ask the network for an object, directly from `source` when one is known.
    pub fn request(&mut self, ctx: &mut StoreContext, source: Option<ContactInfo>, entry: PatchEntry) {
        if !ctx.is_established() {
            if self.pending.add(entry) {
                debug!(service = %S::TAG, "network down, fetch deferred");
            }
            return;
        }
        let slot = (entry.owner, entry.key.clone());
        if let Some((version, _)) = self.inflight.get(&slot) {
            if *version >= entry.version {
                trace!(service = %S::TAG, owner = %entry.owner, "fetch already in flight");
                return;
            }
        }
        let params = match postcard::to_allocvec(&S::object_query(&entry.key, entry.version)) {
            Ok(params) => params,
            Err(err) => {
                warn!(service = %S::TAG, error = %err, "cannot encode object query");
                return;
            }
        };
        self.inflight.insert(slot, (entry.version, ctx.now()));
        match source {
            Some(source) => {
                ctx.send_direct_request(source, entry.owner, S::TAG, params);
            }
            None => {
                ctx.start_search(entry.owner, S::TAG, params, 1);
            }
        }
    }

    /// Start a search with a typed query.
    pub fn search(
        &mut self,
        ctx: &mut StoreContext,
        target: NodeId,
        query: &S::Query,
        target_results: usize,
    ) -> OpResult<crate::protocol::SearchId> {
        if !ctx.is_established() {
            return Err(OpError::NetworkUnestablished);
        }
        let params = postcard::to_allocvec(query)?;
        Ok(ctx.start_search(target, S::TAG, params, target_results))
    }

    /// Write dirty owners; failures stay dirty for the next tick.
    pub fn flush(&mut self) -> usize {
        let mut saved = 0;
        for owner in std::mem::take(&mut self.dirty) {
            match self.flush_owner(owner) {
                Ok(()) => saved += 1,
                Err(err) => {
                    warn!(service = %S::TAG, %owner, error = %err, "save failed, will retry");
                    self.dirty.insert(owner);
                }
            }
        }
        if saved > 0 {
            debug!(service = %S::TAG, owners = saved, "flushed cache");
        }
        saved
    }

    fn flush_owner(&self, owner: NodeId) -> OpResult<()> {
        let headers = self
            .index
            .read()
            .objects(owner)
            .map(|o| o.signed.encode())
            .collect::<OpResult<Vec<_>>>()?;
        if headers.is_empty() {
            self.disk.remove_owner(owner);
            Ok(())
        } else {
            self.disk.save_owner(owner, &headers)
        }
    }

    /// Evict far owners once the index outgrows `prune_size`.
    ///
    /// Never touches the local node, hierarchy members, open views or owners
    /// whose bounds include the local node. Stops at `prune_size / 2`.
    pub fn prune(&mut self, ctx: &mut StoreContext) -> Vec<NodeId> {
        let prune_size = ctx.config().prune_size;
        let len = self.index.read().len();
        if len <= prune_size {
            return Vec::new();
        }
        let local = ctx.local_id();
        let owners: Vec<NodeId> = self.index.read().owners().collect();
        let candidates: Vec<NodeId> = owners
            .into_iter()
            .filter(|owner| {
                *owner != local
                    && !ctx.trust().in_hierarchy(*owner)
                    && !self.views.contains(owner)
                    && !self.in_area(ctx, *owner)
            })
            .collect();
        let victims = farthest_first(local, candidates, len - prune_size / 2);
        for owner in &victims {
            let removed = self.index.write().remove_owner(*owner);
            self.dirty.remove(owner);
            self.disk.remove_owner(*owner);
            self.downloads.retain(|_, d| d.owner != *owner);
            trace!(service = %S::TAG, %owner, objects = removed.len(), "evicted");
        }
        if !victims.is_empty() {
            info!(service = %S::TAG, evicted = victims.len(), remaining = self.index.read().len(), "pruned cache");
        }
        victims
    }

    /// Drop parsed payloads of owners nobody is looking at.
    pub fn unload_cold(&mut self, ctx: &StoreContext) -> usize {
        let local = ctx.local_id();
        let mut index = self.index.write();
        let cold: Vec<NodeId> = index
            .owners()
            .filter(|owner| *owner != local && !self.views.contains(owner))
            .collect();
        let dropped: usize = cold.into_iter().map(|owner| index.unload(owner)).sum();
        if dropped > 0 {
            trace!(service = %S::TAG, dropped, "unloaded cold payloads");
        }
        dropped
    }

    /// True if the local node keeps `owner` because of bounds, its own or a related owner's.
    fn in_area(&self, ctx: &mut StoreContext, owner: NodeId) -> bool {
        if ctx.in_cache_area(owner) {
            return true;
        }
        let related: Vec<NodeId> = self
            .index
            .read()
            .objects(owner)
            .flat_map(|o| S::related_owners(&o.header))
            .collect();
        related.into_iter().any(|r| ctx.in_cache_area(r))
    }

    /// True if an incoming object from the network is worth keeping.
    fn interested(&self, ctx: &mut StoreContext, header: &ObjectHeader) -> bool {
        let owner = header.owner;
        owner == ctx.local_id()
            || self.views.contains(&owner)
            || ctx.trust().in_hierarchy(owner)
            || ctx.in_cache_area(owner)
            || S::related_owners(header)
                .into_iter()
                .any(|r| ctx.in_cache_area(r))
    }

    /// Version-compare an incoming verified object and act on it.
    fn accept(
        &mut self,
        ctx: &mut StoreContext,
        source: Option<ContactInfo>,
        signed: SignedData,
        header: ObjectHeader,
        requested: bool,
    ) {
        if let Err(err) = S::validate(&header) {
            warn!(service = %S::TAG, owner = %header.owner, error = %err, "invalid object body");
            return;
        }
        let owner = header.owner;
        let current = self
            .index
            .read()
            .get(owner, &header.key)
            .map(|o| (o.version(), o.signed.clone()));

        match current {
            Some((local, newer)) if local > header.version => {
                let err = OpError::VersionRegression {
                    owner,
                    remote: header.version,
                    local,
                };
                debug!(service = %S::TAG, error = %err, "answering stale object with ours");
                if let Some(source) = source {
                    if let Err(err) = ctx.send_store(source, S::TAG, &newer) {
                        warn!(service = %S::TAG, error = %err, "push back failed");
                    }
                }
                return;
            }
            Some((local, _)) if local == header.version => {
                if source.is_some() {
                    self.confirm(owner, &header.key);
                }
                return;
            }
            _ => {}
        }

        if source.is_some() && !requested && !self.interested(ctx, &header) {
            trace!(service = %S::TAG, %owner, "object outside bounds ignored");
            return;
        }
        let unique = if source.is_some() {
            UniqueState::Confirmed
        } else {
            UniqueState::Local
        };
        self.install(ctx, signed, header, unique);
    }

    /// Insert a verified object, replacing any older version.
    fn install(
        &mut self,
        ctx: &mut StoreContext,
        signed: SignedData,
        header: ObjectHeader,
        unique: UniqueState,
    ) {
        let owner = header.owner;
        let key = header.key.clone();
        let version = header.version;
        let payload = header.payload;

        let previous = self
            .index
            .write()
            .insert(CachedObject::new(signed, header.clone(), unique));
        if let Some(old) = previous.and_then(|p| p.header.payload) {
            if payload != Some(old) && self.disk.remove_payload(owner, &key, &old) {
                trace!(service = %S::TAG, %owner, "removed superseded payload");
            }
        }

        self.dirty.insert(owner);
        self.pending.satisfied(owner, &key, version);
        self.downloads
            .retain(|_, d| !(d.owner == owner && d.key == key && d.version < version));
        let slot = (owner, key);
        if self.inflight.get(&slot).is_some_and(|(v, _)| *v <= version) {
            self.inflight.remove(&slot);
        }
        debug!(service = %S::TAG, %owner, key = %slot.1, version, "cached object");

        if let Some(payload) = payload {
            let path = self.disk.payload_path(owner, &slot.1, &payload);
            let present = std::fs::metadata(&path)
                .map(|m| m.len() == payload.size)
                .unwrap_or(false);
            if !present {
                self.start_payload_download(ctx, &header, payload);
            }
        }
    }

    fn start_payload_download(&mut self, ctx: &mut StoreContext, header: &ObjectHeader, payload: PayloadRef) {
        let dest = self.disk.payload_path(header.owner, &header.key, &payload);
        let details = FileDetails {
            service: S::TAG,
            hash: payload.hash,
            size: payload.size,
            extra: header.key.as_bytes().to_vec(),
        };
        let ticket = ctx.start_download(header.owner, details, dest);
        self.downloads.insert(
            ticket,
            PayloadDownload {
                owner: header.owner,
                key: header.key.clone(),
                version: header.version,
                started: ctx.now(),
            },
        );
    }

    fn confirm(&mut self, owner: NodeId, key: &ObjectKey) {
        if let Some(object) = self.index.write().get_mut(owner, key) {
            if object.unique != UniqueState::Confirmed {
                trace!(service = %S::TAG, %owner, %key, "confirmed by peer");
                object.unique = UniqueState::Confirmed;
            }
        }
    }

    /// Send an object to its custody sets and scoped hierarchy members.
    fn announce(&mut self, ctx: &mut StoreContext, owner: NodeId, key: &ObjectKey) -> OpResult<usize> {
        let Some((signed, header)) = self
            .index
            .read()
            .get(owner, key)
            .map(|o| (o.signed.clone(), o.header.clone()))
        else {
            return Ok(0);
        };

        let mut sent = ctx.publish_network(owner, S::TAG, &signed)?;
        for related in S::related_owners(&header) {
            if related != owner {
                sent += ctx.publish_network(related, S::TAG, &signed)?;
            }
        }
        if let Some(scope) = S::scope(&header) {
            let members: Vec<ContactInfo> = ctx
                .trust()
                .region_members(owner, scope)
                .into_iter()
                .filter_map(|id| ctx.routing.get(id))
                .map(|c| ContactInfo {
                    id: c.id,
                    addr: c.addr,
                })
                .collect();
            ctx.publish_direct(&members, S::TAG, &signed)?;
            sent += members.len();
        }

        if sent > 0 {
            if let Some(object) = self.index.write().get_mut(owner, key) {
                if object.unique == UniqueState::Local {
                    object.unique = UniqueState::Announced;
                }
            }
        }
        Ok(sent)
    }

    fn expire_inflight(&mut self, now: Instant, timeout: std::time::Duration) {
        self.inflight
            .retain(|_, (_, started)| now.saturating_duration_since(*started) < timeout);
    }

    /// Forget downloads the transfer component never finished.
    ///
    /// A later `detail` call for the object starts a fresh download.
    fn expire_downloads(&mut self, now: Instant, timeout: std::time::Duration) {
        let before = self.downloads.len();
        self.downloads
            .retain(|_, d| now.saturating_duration_since(d.started) < timeout);
        let dropped = before - self.downloads.len();
        if dropped > 0 {
            debug!(service = %S::TAG, dropped, "abandoned stalled payload downloads");
        }
    }
}

/// Decode and verify stored or received bytes for service `S`.
fn verified<S: CacheSpec>(bytes: &[u8]) -> OpResult<(SignedData, ObjectHeader)> {
    let signed = SignedData::decode(bytes)?;
    let header = signed.verify()?;
    if header.service != S::TAG || header.key.len() != S::KEY_WIDTH {
        return Err(OpError::MalformedPacket(format!(
            "{} object with {}-byte key in {} cache",
            header.service,
            header.key.len(),
            S::TAG
        )));
    }
    Ok((signed, header))
}

impl<S: CacheSpec> Service for ServiceCache<S> {
    fn tag(&self) -> ServiceTag {
        S::TAG
    }

    fn key_width(&self) -> usize {
        S::KEY_WIDTH
    }

    fn on_store(
        &mut self,
        ctx: &mut StoreContext,
        source: Option<ContactInfo>,
        signed: SignedData,
        header: ObjectHeader,
    ) {
        self.accept(ctx, source, signed, header, false);
    }

    fn on_replicate(&mut self, ctx: &mut StoreContext, contact: ContactInfo) -> Vec<PatchEntry> {
        let held: Vec<(PatchEntry, Vec<NodeId>)> = self
            .index
            .read()
            .iter()
            .map(|(owner, o)| {
                (
                    PatchEntry::new(owner, o.header.key.clone(), o.version()),
                    S::related_owners(&o.header),
                )
            })
            .collect();
        held.into_iter()
            .filter(|(entry, related)| {
                ctx.routing.covers(entry.owner, contact.id)
                    || related.iter().any(|r| ctx.routing.covers(*r, contact.id))
            })
            .map(|(entry, _)| entry)
            .collect()
    }

    fn on_patch(&mut self, ctx: &mut StoreContext, source: ContactInfo, entries: Vec<PatchEntry>) {
        for entry in entries {
            let local = self
                .index
                .read()
                .get(entry.owner, &entry.key)
                .map(|o| (o.version(), o.signed.clone()));
            match local {
                Some((version, signed)) if version > entry.version => {
                    if let Err(err) = ctx.send_store(source, S::TAG, &signed) {
                        warn!(service = %S::TAG, error = %err, "push to stale peer failed");
                    }
                }
                Some((version, _)) if version == entry.version => {
                    self.confirm(entry.owner, &entry.key);
                }
                Some(_) => {
                    // the network already holds something at least as new
                    self.confirm(entry.owner, &entry.key);
                    self.request(ctx, Some(source), entry);
                }
                None => self.request(ctx, Some(source), entry),
            }
        }
    }

    fn retains_owner(&self, ctx: &mut StoreContext, owner: NodeId) -> bool {
        self.index.read().contains_owner(owner) && self.in_area(ctx, owner)
    }

    fn on_search_local(
        &mut self,
        _ctx: &mut StoreContext,
        target: NodeId,
        params: &[u8],
    ) -> Vec<Vec<u8>> {
        let query: S::Query = match postcard::from_bytes(params) {
            Ok(query) => query,
            Err(err) => {
                debug!(service = %S::TAG, error = %err, "undecodable search parameters");
                return Vec::new();
            }
        };
        let index = self.index.read();
        S::search(&index, target, &query)
            .into_iter()
            .filter_map(|(owner, key)| index.get(owner, &key))
            .filter_map(|o| o.signed.encode().ok())
            .collect()
    }

    fn on_search_result(&mut self, ctx: &mut StoreContext, hit: SearchHit) {
        for bytes in hit.results {
            match verified::<S>(&bytes) {
                Ok((signed, header)) => self.accept(ctx, Some(hit.source), signed, header, true),
                Err(err) => {
                    warn!(service = %S::TAG, peer = %hit.source.id, error = %err, "bad search result")
                }
            }
        }
    }

    fn on_status_change(&mut self, ctx: &mut StoreContext, established: bool) {
        if !established {
            let mut reverted = 0;
            for object in self.index.write().iter_mut() {
                if object.unique == UniqueState::Confirmed {
                    object.unique = UniqueState::Announced;
                    reverted += 1;
                }
            }
            debug!(service = %S::TAG, reverted, "network lost");
            return;
        }

        let deferred = self.pending.drain();
        let replay: Vec<PatchEntry> = deferred
            .into_iter()
            .filter(|e| ctx.in_cache_area(e.owner))
            .collect();
        if !replay.is_empty() {
            info!(service = %S::TAG, count = replay.len(), "replaying deferred fetches");
        }
        for entry in replay {
            self.request(ctx, None, entry);
        }

        let local = ctx.local_id();
        let unique: Vec<(NodeId, ObjectKey)> = self
            .index
            .read()
            .iter()
            .filter(|(_, o)| o.unique.is_unique())
            .map(|(owner, o)| (owner, o.header.key.clone()))
            .collect();
        let mut republished = 0;
        for (owner, key) in unique {
            if owner != local && !self.in_area(ctx, owner) {
                continue;
            }
            match self.announce(ctx, owner, &key) {
                Ok(_) => republished += 1,
                Err(err) => warn!(service = %S::TAG, %owner, error = %err, "republish failed"),
            }
        }
        if republished > 0 {
            info!(service = %S::TAG, republished, "republished unconfirmed objects");
        }
    }

    fn on_tick(&mut self, ctx: &mut StoreContext) {
        let now = ctx.now();
        self.expire_inflight(now, ctx.config().search_timeout());
        self.expire_downloads(now, ctx.config().download_timeout());
        if now.saturating_duration_since(self.last_save) >= ctx.config().save_interval() {
            self.last_save = now;
            self.flush();
            self.unload_cold(ctx);
        }
        self.prune(ctx);
        if !ctx.is_established() {
            let dropped = self.pending.prune(ctx.local_id(), ctx.config().prune_size);
            if dropped > 0 {
                debug!(service = %S::TAG, dropped, "pruned deferred fetches");
            }
        }
    }

    fn on_download_complete(
        &mut self,
        _ctx: &mut StoreContext,
        ticket: DownloadTicket,
        result: OpResult<()>,
    ) {
        let Some(PayloadDownload {
            owner, key, version, ..
        }) = self.downloads.remove(&ticket)
        else {
            debug!(service = %S::TAG, ticket, "completion for unknown download");
            return;
        };
        if let Err(err) = result {
            warn!(service = %S::TAG, %owner, error = %err, "payload download failed");
            return;
        }
        let payload = self
            .index
            .read()
            .get(owner, &key)
            .filter(|o| o.version() == version)
            .and_then(|o| o.header.payload);
        let Some(payload) = payload else {
            debug!(service = %S::TAG, %owner, "downloaded payload was superseded");
            return;
        };
        let path = self.disk.payload_path(owner, &key, &payload);
        if file::payload_matches(&path, &payload) {
            debug!(service = %S::TAG, %owner, %key, "payload ready");
        } else {
            warn!(service = %S::TAG, %owner, %key, "downloaded payload does not match its hash");
            let _ = std::fs::remove_file(&path);
        }
    }

    fn file_search(&self, owner: NodeId, details: &FileDetails) -> bool {
        self.file_request(owner, details).is_some()
    }

    fn file_request(&self, owner: NodeId, details: &FileDetails) -> Option<PathBuf> {
        if details.service != S::TAG {
            return None;
        }
        let wanted = PayloadRef::new(details.hash, details.size);
        let index = self.index.read();
        let object = index
            .objects(owner)
            .find(|o| o.header.payload == Some(wanted))?;
        let path = self.disk.payload_path(owner, &object.header.key, &wanted);
        path.exists().then_some(path)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
