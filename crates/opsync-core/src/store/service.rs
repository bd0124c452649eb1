//! The capability set a feature registers with the object store.

use std::any::Any;
use std::path::PathBuf;

use crate::collaborators::DownloadTicket;
use crate::digest::PatchEntry;
use crate::error::OpResult;
use crate::protocol::ContactInfo;
use crate::search::SearchHit;
use crate::store::StoreContext;
use crate::types::{FileDetails, NodeId, ServiceTag};
use crate::versioned::{ObjectHeader, SignedData};

/// A feature plugged into the object store, keyed by its [`ServiceTag`].
///
/// Every method runs on the core loop with exclusive access to the
/// [`StoreContext`]; handlers never run concurrently with each other.
pub trait Service: Send + 'static {
    fn tag(&self) -> ServiceTag;

    /// Width in bytes of this service's object keys
    fn key_width(&self) -> usize;

    /// A verified object arrived. `source` is `None` for local publishes.
    ///
    /// The service decides whether to cache, ignore or push back.
    fn on_store(
        &mut self,
        ctx: &mut StoreContext,
        source: Option<ContactInfo>,
        signed: SignedData,
        header: ObjectHeader,
    );

    /// Digest entries for objects `contact` should now hold.
    fn on_replicate(&mut self, ctx: &mut StoreContext, contact: ContactInfo) -> Vec<PatchEntry>;

    /// Digest entries from `source`, already filtered to owners in local bounds.
    fn on_patch(&mut self, ctx: &mut StoreContext, source: ContactInfo, entries: Vec<PatchEntry>);

    /// True if objects of `owner` are held on behalf of another in-bounds
    /// owner, such as replies kept with their thread.
    fn retains_owner(&self, _ctx: &mut StoreContext, _owner: NodeId) -> bool {
        false
    }

    /// Answer a search request from the local cache.
    fn on_search_local(
        &mut self,
        ctx: &mut StoreContext,
        target: NodeId,
        params: &[u8],
    ) -> Vec<Vec<u8>>;

    /// Results for a search this service started.
    fn on_search_result(&mut self, ctx: &mut StoreContext, hit: SearchHit);

    /// The network became established or was lost.
    fn on_status_change(&mut self, ctx: &mut StoreContext, established: bool);

    /// Periodic maintenance: flush, prune, unload. Must be idempotent.
    fn on_tick(&mut self, ctx: &mut StoreContext);

    /// A download started through the transfer component finished.
    fn on_download_complete(
        &mut self,
        ctx: &mut StoreContext,
        ticket: DownloadTicket,
        result: OpResult<()>,
    );

    /// True if the payload described by `details` is held locally.
    fn file_search(&self, owner: NodeId, details: &FileDetails) -> bool;

    /// Local path of the payload described by `details`, if held.
    fn file_request(&self, owner: NodeId, details: &FileDetails) -> Option<PathBuf>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}
