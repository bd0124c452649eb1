//! Discussion boards on top of the service cache.
//!
//! A post is keyed by `(project, post_id)` under its author. A thread is a
//! root post; replies name the root by `(owner, post_id)` and are owned by
//! whoever wrote them, so each reply lives in two custody sets: its
//! author's and the thread owner's.
//!
//! ```text
//! key (8 bytes)  = project u32 LE | post_id u32 LE
//! header.body    = postcard PostBody { parent, scope }
//! payload        = postcard PostContent { info, message, attachments }, key in clear
//! ```

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cache::{CacheIndex, CacheSpec, SealedPayload, ServiceCache};
use crate::error::{OpError, OpResult};
use crate::protocol::SearchId;
use crate::store::StoreContext;
use crate::types::{NodeId, ObjectKey, ServiceTag, Version};
use crate::versioned::{ObjectHeader, PayloadKey};

/// Results wanted by thread and time searches
pub const LIST_RESULTS: usize = 50;

/// Results wanted when fetching one post
pub const POST_RESULTS: usize = 2;

pub fn post_key(project: u32, post_id: u32) -> ObjectKey {
    let mut key = Vec::with_capacity(8);
    key.extend_from_slice(&project.to_le_bytes());
    key.extend_from_slice(&post_id.to_le_bytes());
    ObjectKey(key)
}

/// `(project, post_id)` of a board key
pub fn split_key(key: &ObjectKey) -> Option<(u32, u32)> {
    let bytes: [u8; 8] = key.as_bytes().try_into().ok()?;
    let (project, post_id) = bytes.split_at(4);
    Some((
        u32::from_le_bytes(project.try_into().ok()?),
        u32::from_le_bytes(post_id.try_into().ok()?),
    ))
}

/// Root post of a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadRef {
    pub owner: NodeId,
    pub post_id: u32,
}

/// Service fields of a board header
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostBody {
    /// Thread this post replies to; `None` for a thread root
    pub parent: Option<ThreadRef>,
    /// Hierarchy scope the post is addressed to
    pub scope: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PostFormat {
    #[default]
    Plain,
    Markdown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostInfo {
    pub subject: String,
    pub format: PostFormat,
    /// One-line teaser shown in listings
    pub quip: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub data: Vec<u8>,
}

/// Decrypted payload of a post
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostContent {
    pub info: PostInfo,
    pub message: String,
    pub attachments: Vec<Attachment>,
}

impl PostContent {
    pub fn new(subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            info: PostInfo {
                subject: subject.into(),
                ..Default::default()
            },
            message: message.into(),
            attachments: Vec::new(),
        }
    }

    /// Serialize and encrypt; CPU bound for large attachments.
    pub fn seal(&self) -> OpResult<SealedPayload> {
        SealedPayload::seal(&postcard::to_allocvec(self)?)
    }
}

/// Board search parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoardQuery {
    /// Thread roots of a project, or one thread's posts when `parent` is set
    Threads {
        project: u32,
        parent: Option<ThreadRef>,
    },
    /// Posts of a project edited at or after `since` (unix millis)
    Time { project: u32, since: i64 },
    /// One post of the search target at `version` or newer
    Post { key: ObjectKey, version: Version },
}

impl BoardQuery {
    pub fn target_results(&self) -> usize {
        match self {
            BoardQuery::Threads { .. } | BoardQuery::Time { .. } => LIST_RESULTS,
            BoardQuery::Post { .. } => POST_RESULTS,
        }
    }
}

/// Thread root → replies, across owners
#[derive(Debug, Default)]
pub struct BoardIndex {
    replies: HashMap<(ThreadRef, u32), BTreeSet<(NodeId, ObjectKey)>>,
}

impl BoardIndex {
    pub fn replies(&self, thread: ThreadRef, project: u32) -> impl Iterator<Item = &(NodeId, ObjectKey)> {
        self.replies.get(&(thread, project)).into_iter().flatten()
    }
}

fn body(header: &ObjectHeader) -> OpResult<PostBody> {
    postcard::from_bytes(&header.body).map_err(|e| OpError::MalformedPacket(format!("post body: {}", e)))
}

/// Board instantiation of the cache engine
pub struct BoardSpec;

impl CacheSpec for BoardSpec {
    type Detail = PostContent;
    type Index = BoardIndex;
    type Query = BoardQuery;

    const TAG: ServiceTag = ServiceTag::BOARD;
    const KEY_WIDTH: usize = 8;

    fn validate(header: &ObjectHeader) -> OpResult<()> {
        let body = body(header)?;
        let (_, post_id) = split_key(&header.key)
            .ok_or_else(|| OpError::MalformedPacket("board key must be 8 bytes".to_string()))?;
        if let Some(parent) = body.parent {
            if parent.owner == header.owner && parent.post_id == post_id {
                return Err(OpError::MalformedPacket("post replies to itself".to_string()));
            }
        }
        if header.payload.is_some() && !matches!(header.payload_key, PayloadKey::Clear(_)) {
            return Err(OpError::MalformedPacket("board payload key must be clear".to_string()));
        }
        Ok(())
    }

    fn parse_detail(plaintext: &[u8]) -> OpResult<PostContent> {
        Ok(postcard::from_bytes(plaintext)?)
    }

    fn index_insert(index: &mut BoardIndex, header: &ObjectHeader) {
        if let (Ok(PostBody { parent: Some(parent), .. }), Some((project, _))) =
            (body(header), split_key(&header.key))
        {
            index
                .replies
                .entry((parent, project))
                .or_default()
                .insert((header.owner, header.key.clone()));
        }
    }

    fn index_remove(index: &mut BoardIndex, header: &ObjectHeader) {
        if let (Ok(PostBody { parent: Some(parent), .. }), Some((project, _))) =
            (body(header), split_key(&header.key))
        {
            if let Some(set) = index.replies.get_mut(&(parent, project)) {
                set.remove(&(header.owner, header.key.clone()));
                if set.is_empty() {
                    index.replies.remove(&(parent, project));
                }
            }
        }
    }

    fn object_query(key: &ObjectKey, version: Version) -> BoardQuery {
        BoardQuery::Post {
            key: key.clone(),
            version,
        }
    }

    fn search(index: &CacheIndex<Self>, target: NodeId, query: &BoardQuery) -> Vec<(NodeId, ObjectKey)> {
        let mut found: Vec<(i64, NodeId, ObjectKey)> = match query {
            BoardQuery::Post { key, version } => {
                return index
                    .get(target, key)
                    .filter(|o| o.version() >= *version)
                    .map(|o| vec![(target, o.header.key.clone())])
                    .unwrap_or_default();
            }
            BoardQuery::Threads {
                project,
                parent: Some(thread),
            } => {
                let root = post_key(*project, thread.post_id);
                index
                    .get(thread.owner, &root)
                    .map(|o| (o.header.edit_time, thread.owner, root.clone()))
                    .into_iter()
                    .chain(index.secondary().replies(*thread, *project).filter_map(|(owner, key)| {
                        index.get(*owner, key).map(|o| (o.header.edit_time, *owner, key.clone()))
                    }))
                    .collect()
            }
            BoardQuery::Threads {
                project,
                parent: None,
            } => index
                .iter()
                .filter(|(_, o)| {
                    split_key(&o.header.key).map(|(p, _)| p) == Some(*project)
                        && body(&o.header).map(|b| b.parent.is_none()).unwrap_or(false)
                })
                .map(|(owner, o)| (o.header.edit_time, owner, o.header.key.clone()))
                .collect(),
            BoardQuery::Time { project, since } => index
                .iter()
                .filter(|(_, o)| {
                    split_key(&o.header.key).map(|(p, _)| p) == Some(*project)
                        && o.header.edit_time >= *since
                })
                .map(|(owner, o)| (o.header.edit_time, owner, o.header.key.clone()))
                .collect(),
        };
        found.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| (a.1, &a.2).cmp(&(b.1, &b.2))));
        found.truncate(query.target_results());
        found.into_iter().map(|(_, owner, key)| (owner, key)).collect()
    }

    fn related_owners(header: &ObjectHeader) -> Vec<NodeId> {
        match body(header) {
            Ok(PostBody {
                parent: Some(parent),
                ..
            }) if parent.owner != header.owner => vec![parent.owner],
            _ => Vec::new(),
        }
    }

    fn scope(header: &ObjectHeader) -> Option<u32> {
        body(header).ok()?.scope
    }
}

pub type Board = ServiceCache<BoardSpec>;

/// Listing row for a post
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PostSummary {
    pub owner: NodeId,
    pub project: u32,
    pub post_id: u32,
    pub version: Version,
    pub edit_time: i64,
    pub parent: Option<ThreadRef>,
    /// Known once the payload has been read
    pub subject: Option<String>,
}

/// A post with its content, when the payload is on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Post {
    pub summary: PostSummary,
    pub content: Option<PostContent>,
}

fn summary(index: &CacheIndex<BoardSpec>, owner: NodeId, key: &ObjectKey) -> Option<PostSummary> {
    let object = index.get(owner, key)?;
    let (project, post_id) = split_key(key)?;
    Some(PostSummary {
        owner,
        project,
        post_id,
        version: object.version(),
        edit_time: object.header.edit_time,
        parent: body(&object.header).ok()?.parent,
        subject: object.detail.as_ref().map(|d| d.info.subject.clone()),
    })
}

/// Thread roots of `project`, newest first
pub fn threads(index: &CacheIndex<BoardSpec>, project: u32) -> Vec<PostSummary> {
    let mut rows: Vec<PostSummary> = index
        .iter()
        .filter_map(|(owner, o)| summary(index, owner, &o.header.key))
        .filter(|s| s.project == project && s.parent.is_none())
        .collect();
    rows.sort_by(|a, b| b.edit_time.cmp(&a.edit_time).then(a.owner.cmp(&b.owner)));
    rows
}

/// Replies in a thread, oldest first
pub fn replies(index: &CacheIndex<BoardSpec>, thread: ThreadRef, project: u32) -> Vec<PostSummary> {
    let mut rows: Vec<PostSummary> = index
        .secondary()
        .replies(thread, project)
        .filter_map(|(owner, key)| summary(index, *owner, key))
        .collect();
    rows.sort_by(|a, b| a.edit_time.cmp(&b.edit_time).then(a.owner.cmp(&b.owner)));
    rows
}

impl ServiceCache<BoardSpec> {
    /// Next free post id in `project` for the local node
    fn next_post_id(&self, ctx: &StoreContext, project: u32) -> OpResult<u32> {
        let highest = self
            .reader()
            .read()
            .objects(ctx.local_id())
            .filter_map(|o| split_key(&o.header.key))
            .filter(|(p, _)| *p == project)
            .map(|(_, id)| id)
            .max();
        match highest {
            None => Ok(1),
            Some(id) => id
                .checked_add(1)
                .ok_or_else(|| OpError::Exhausted(format!("post ids of project {}", project))),
        }
    }

    /// Publish a new thread root, or a reply when `parent` is set.
    pub fn post_message(
        &mut self,
        ctx: &mut StoreContext,
        project: u32,
        parent: Option<ThreadRef>,
        scope: Option<u32>,
        sealed: SealedPayload,
    ) -> OpResult<ObjectKey> {
        let key = post_key(project, self.next_post_id(ctx, project)?);
        let body = postcard::to_allocvec(&PostBody { parent, scope })?;
        let header = ObjectHeader::new(ctx.keypair(), BoardSpec::TAG, key.clone(), body)
            .with_payload(sealed.payload, PayloadKey::Clear(sealed.object_key));
        self.publish(ctx, header, Some(sealed))?;
        if let Some(parent) = parent {
            self.open_view(parent.owner);
        }
        info!(project, key = %key, reply = parent.is_some(), "posted message");
        Ok(key)
    }

    /// Replace the content of one of our posts; returns the new version.
    pub fn post_edit(
        &mut self,
        ctx: &mut StoreContext,
        key: &ObjectKey,
        sealed: SealedPayload,
    ) -> OpResult<Version> {
        let local = ctx.local_id();
        let current = self
            .reader()
            .read()
            .get(local, key)
            .map(|o| o.header.clone())
            .ok_or_else(|| OpError::NotFound(format!("own post {}", key)))?;
        let header = current
            .edited()?
            .with_payload(sealed.payload, PayloadKey::Clear(sealed.object_key));
        let version = header.version;
        self.publish(ctx, header, Some(sealed))?;
        debug!(key = %key, version, "edited post");
        Ok(version)
    }

    /// Look for thread roots of `project`, or the posts of one thread.
    pub fn thread_search(
        &mut self,
        ctx: &mut StoreContext,
        project: u32,
        parent: Option<ThreadRef>,
    ) -> OpResult<SearchId> {
        if let Some(parent) = parent {
            self.open_view(parent.owner);
        }
        let target = parent.map(|p| p.owner).unwrap_or_else(|| ctx.local_id());
        let query = BoardQuery::Threads { project, parent };
        let results = query.target_results();
        self.search(ctx, target, &query, results)
    }

    /// Look for posts of `project` edited since `since` (unix millis).
    pub fn time_search(&mut self, ctx: &mut StoreContext, project: u32, since: i64) -> OpResult<SearchId> {
        let query = BoardQuery::Time { project, since };
        let results = query.target_results();
        let target = ctx.local_id();
        self.search(ctx, target, &query, results)
    }

    /// A cached post with its content. Unknown posts are requested from the
    /// network and `None` is returned until they arrive.
    pub fn get_post(&mut self, ctx: &mut StoreContext, owner: NodeId, key: &ObjectKey) -> OpResult<Option<Post>> {
        let found = summary(&self.reader().read(), owner, key);
        let Some(found) = found else {
            if ctx.is_established() {
                let query = BoardQuery::Post {
                    key: key.clone(),
                    version: 0,
                };
                self.search(ctx, owner, &query, POST_RESULTS)?;
            }
            return Ok(None);
        };
        let content = match self.detail(ctx, owner, key) {
            Ok(content) => content,
            Err(OpError::PayloadMissing(_)) => None,
            Err(err) => return Err(err),
        };
        let summary = PostSummary {
            subject: content.as_ref().map(|c| c.info.subject.clone()),
            ..found
        };
        Ok(Some(Post { summary, content }))
    }

    pub fn threads(&self, project: u32) -> Vec<PostSummary> {
        threads(&self.reader().read(), project)
    }

    pub fn replies(&self, thread: ThreadRef, project: u32) -> Vec<PostSummary> {
        replies(&self.reader().read(), thread, project)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{NoTrust, TransferQueue};
    use crate::config::NodeConfig;
    use crate::identity::NodeKeypair;
    use crate::protocol::{ContactInfo, Packet};
    use crate::store::Service;
    use crate::versioned::SignedData;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn context(dir: &TempDir, seed: u8) -> StoreContext {
        context_with(dir, seed, NodeConfig::default())
    }

    fn context_with(dir: &TempDir, seed: u8, config: NodeConfig) -> StoreContext {
        StoreContext::new(
            NodeKeypair::from_seed(&[seed; 32]),
            config,
            [4u8; 32],
            dir.path(),
            Arc::new(NoTrust),
            Arc::new(TransferQueue::new()),
        )
    }

    fn contact(id: NodeId, port: u16) -> ContactInfo {
        ContactInfo {
            id,
            addr: SocketAddr::from(([127, 0, 0, 1], port)),
        }
    }

    #[test]
    fn test_key_layout() {
        let key = post_key(7, 300);
        assert_eq!(key.as_bytes(), &[7, 0, 0, 0, 44, 1, 0, 0]);
        assert_eq!(split_key(&key), Some((7, 300)));
        assert_eq!(split_key(&ObjectKey(vec![1, 2, 3])), None);
    }

    #[test]
    fn test_post_and_read_back() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir, 1);
        let local = ctx.local_id();
        let mut board = Board::new(&ctx);
        let content = PostContent::new("hello", "first post");
        let key = board
            .post_message(&mut ctx, 3, None, None, content.seal().unwrap())
            .unwrap();
        assert_eq!(split_key(&key), Some((3, 1)));

        let post = board.get_post(&mut ctx, local, &key).unwrap().unwrap();
        assert_eq!(post.content, Some(content));
        assert_eq!(post.summary.subject.as_deref(), Some("hello"));

        let second = board
            .post_message(&mut ctx, 3, None, None, PostContent::new("again", "").seal().unwrap())
            .unwrap();
        assert_eq!(split_key(&second), Some((3, 2)));
        assert_eq!(board.threads(3).len(), 2);
        assert!(board.threads(4).is_empty());
    }

    #[test]
    fn test_edit_bumps_version_and_keeps_key() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir, 1);
        let local = ctx.local_id();
        let mut board = Board::new(&ctx);
        let key = board
            .post_message(&mut ctx, 1, None, None, PostContent::new("v0", "a").seal().unwrap())
            .unwrap();
        let version = board
            .post_edit(&mut ctx, &key, PostContent::new("v1", "b").seal().unwrap())
            .unwrap();
        assert_eq!(version, 2);
        let post = board.get_post(&mut ctx, local, &key).unwrap().unwrap();
        assert_eq!(post.summary.version, 2);
        assert_eq!(post.content.unwrap().message, "b");
        assert_eq!(board.threads(1).len(), 1);
    }

    #[test]
    fn test_edit_unknown_post_fails() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir, 1);
        let mut board = Board::new(&ctx);
        let result = board.post_edit(&mut ctx, &post_key(1, 9), PostContent::default().seal().unwrap());
        assert!(matches!(result, Err(OpError::NotFound(_))));
    }

    #[test]
    fn test_post_ids_exhausted() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir, 1);
        let mut board = Board::new(&ctx);
        let body = postcard::to_allocvec(&PostBody::default()).unwrap();
        let last = ObjectHeader::new(ctx.keypair(), BoardSpec::TAG, post_key(2, u32::MAX), body);
        board.publish(&mut ctx, last, None).unwrap();

        let result = board.post_message(&mut ctx, 2, None, None, PostContent::new("one more", "").seal().unwrap());
        assert!(matches!(result, Err(OpError::Exhausted(_))));
        // other projects are unaffected
        let key = board
            .post_message(&mut ctx, 3, None, None, PostContent::new("fresh", "").seal().unwrap())
            .unwrap();
        assert_eq!(split_key(&key), Some((3, 1)));
    }

    #[test]
    fn test_reply_indexed_under_thread() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir, 1);
        let local = ctx.local_id();
        let mut board = Board::new(&ctx);
        let root_key = board
            .post_message(&mut ctx, 5, None, None, PostContent::new("root", "").seal().unwrap())
            .unwrap();
        let thread = ThreadRef {
            owner: local,
            post_id: split_key(&root_key).unwrap().1,
        };

        // a reply from someone else arrives over the network
        let replier = NodeKeypair::from_seed(&[2u8; 32]);
        let body = postcard::to_allocvec(&PostBody {
            parent: Some(thread),
            scope: None,
        })
        .unwrap();
        let header = ObjectHeader::new(&replier, BoardSpec::TAG, post_key(5, 1), body);
        let signed = SignedData::sign(&replier, &header).unwrap();
        board.on_store(&mut ctx, Some(contact(replier.node_id(), 4000)), signed, header);

        let replies = board.replies(thread, 5);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].owner, replier.node_id());
        assert_eq!(board.threads(5).len(), 1);

        let params = postcard::to_allocvec(&BoardQuery::Threads {
            project: 5,
            parent: Some(thread),
        })
        .unwrap();
        let results = board.on_search_local(&mut ctx, thread.owner, &params);
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn test_reply_to_self_rejected() {
        let keypair = NodeKeypair::from_seed(&[2u8; 32]);
        let body = postcard::to_allocvec(&PostBody {
            parent: Some(ThreadRef {
                owner: keypair.node_id(),
                post_id: 4,
            }),
            scope: None,
        })
        .unwrap();
        let header = ObjectHeader::new(&keypair, BoardSpec::TAG, post_key(1, 4), body);
        assert!(BoardSpec::validate(&header).is_err());
    }

    #[test]
    fn test_reply_published_to_both_custody_sets() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context_with(
            &dir,
            1,
            NodeConfig {
                custody_size: 1,
                ..Default::default()
            },
        );
        let mut board = Board::new(&ctx);
        let thread_owner = NodeId(ctx.local_id().0 ^ 0xffff_0000_0000_0000);
        let near_owner = NodeId(thread_owner.0 ^ 1);
        let near_me = NodeId(ctx.local_id().0 ^ 1);
        let now = ctx.now();
        ctx.routing.touch(near_owner, contact(near_owner, 1).addr, now);
        ctx.routing.touch(near_me, contact(near_me, 2).addr, now);
        ctx.set_established(true);

        board
            .post_message(
                &mut ctx,
                1,
                Some(ThreadRef {
                    owner: thread_owner,
                    post_id: 1,
                }),
                None,
                PostContent::new("re", "").seal().unwrap(),
            )
            .unwrap();
        let dests: BTreeSet<NodeId> = ctx
            .drain_outbox()
            .into_iter()
            .filter(|o| matches!(o.packet, Packet::Store { .. }))
            .filter_map(|o| o.dest)
            .collect();
        assert_eq!(dests, BTreeSet::from([near_owner, near_me]));
    }

    #[test]
    fn test_time_search_filters_by_edit_time() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir, 1);
        let local = ctx.local_id();
        let mut board = Board::new(&ctx);
        let key = board
            .post_message(&mut ctx, 2, None, None, PostContent::new("a", "").seal().unwrap())
            .unwrap();
        let edit_time = board.get_post(&mut ctx, local, &key).unwrap().unwrap().summary.edit_time;

        let later = postcard::to_allocvec(&BoardQuery::Time {
            project: 2,
            since: edit_time + 1,
        })
        .unwrap();
        let earlier = postcard::to_allocvec(&BoardQuery::Time {
            project: 2,
            since: edit_time,
        })
        .unwrap();
        assert!(board.on_search_local(&mut ctx, local, &later).is_empty());
        assert_eq!(board.on_search_local(&mut ctx, local, &earlier).len(), 1);
    }

    #[test]
    fn test_searches_need_network() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir, 1);
        let mut board = Board::new(&ctx);
        assert!(matches!(
            board.thread_search(&mut ctx, 1, None),
            Err(OpError::NetworkUnestablished)
        ));
        let peer = contact(NodeId(9), 4000);
        let now = ctx.now();
        ctx.routing.touch(peer.id, peer.addr, now);
        ctx.set_established(true);
        board.time_search(&mut ctx, 1, 0).unwrap();
        assert!(ctx
            .drain_outbox()
            .iter()
            .any(|o| matches!(o.packet, Packet::SearchReq { .. })));
    }
}
