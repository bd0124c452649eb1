//! The core loop.
//!
//! One tokio task owns the [`ObjectStore`] and every service cache. The
//! transport receiver, payload workers and API handles talk to it over
//! channels, so store handlers never run concurrently.
//!
//! ```text
//!  UdpTransport ──Inbound──┐
//!  NodeHandle ───Command───┤
//!  spawn_blocking ─Sealed──┼──▶ Node::run ──▶ ObjectStore ──outbox──▶ UdpTransport
//!  interval ──────tick─────┘
//! ```

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::board::{self, Board, BoardSpec, Post, PostContent, PostSummary, ThreadRef};
use crate::cache::{CacheReader, SealedPayload};
use crate::collaborators::{DownloadTicket, NoTrust, NullTransfers, Transfers, TrustLinks};
use crate::config::NodeConfig;
use crate::error::{OpError, OpResult};
use crate::protocol::{ContactInfo, SearchId};
use crate::storage::Storage;
use crate::store::{ObjectStore, StoreContext};
use crate::transport::{Inbound, UdpTransport};
use crate::types::{FileDetails, NodeId, ObjectKey, ServiceTag, Version};

const COMMAND_QUEUE: usize = 64;
const INBOUND_QUEUE: usize = 1024;

/// Events for observers of a running node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// The network became established or was lost
    StatusChanged { established: bool },
}

/// Snapshot of a running node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub contacts: usize,
    pub established: bool,
    pub live_searches: usize,
}

/// Everything needed to start a node
pub struct NodeOptions {
    pub data_dir: PathBuf,
    pub config: NodeConfig,
    pub bind_ip: IpAddr,
    pub transfers: Arc<dyn Transfers>,
    pub trust: Arc<dyn TrustLinks>,
}

enum Command {
    Bootstrap(SocketAddr),
    Post {
        project: u32,
        parent: Option<ThreadRef>,
        scope: Option<u32>,
        content: PostContent,
        reply: oneshot::Sender<OpResult<ObjectKey>>,
    },
    Edit {
        key: ObjectKey,
        content: PostContent,
        reply: oneshot::Sender<OpResult<Version>>,
    },
    ThreadSearch {
        project: u32,
        parent: Option<ThreadRef>,
        reply: oneshot::Sender<OpResult<SearchId>>,
    },
    TimeSearch {
        project: u32,
        since: i64,
        reply: oneshot::Sender<OpResult<SearchId>>,
    },
    GetPost {
        owner: NodeId,
        key: ObjectKey,
        reply: oneshot::Sender<OpResult<Option<Post>>>,
    },
    OpenView(NodeId, bool),
    DownloadComplete {
        service: ServiceTag,
        ticket: DownloadTicket,
        result: OpResult<()>,
    },
    FileRequest {
        owner: NodeId,
        details: FileDetails,
        reply: oneshot::Sender<Option<PathBuf>>,
    },
    Info(oneshot::Sender<NodeInfo>),
    Shutdown(oneshot::Sender<()>),
}

/// A payload sealed off the core loop, waiting to be published
enum Sealed {
    Post {
        project: u32,
        parent: Option<ThreadRef>,
        scope: Option<u32>,
        payload: OpResult<SealedPayload>,
        reply: oneshot::Sender<OpResult<ObjectKey>>,
    },
    Edit {
        key: ObjectKey,
        payload: OpResult<SealedPayload>,
        reply: oneshot::Sender<OpResult<Version>>,
    },
}

/// Cheap, cloneable access to a running node
#[derive(Clone)]
pub struct NodeHandle {
    id: NodeId,
    addr: SocketAddr,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<NodeEvent>,
    board: CacheReader<BoardSpec>,
}

impl NodeHandle {
    pub fn local_id(&self) -> NodeId {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Read handle on the board cache
    pub fn board_reader(&self) -> CacheReader<BoardSpec> {
        Arc::clone(&self.board)
    }

    async fn send(&self, command: Command) -> OpResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| OpError::NodeStopped)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> OpResult<T> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        rx.await.map_err(|_| OpError::NodeStopped)
    }

    pub async fn bootstrap(&self, addr: SocketAddr) -> OpResult<()> {
        self.send(Command::Bootstrap(addr)).await
    }

    pub async fn post_message(
        &self,
        project: u32,
        parent: Option<ThreadRef>,
        scope: Option<u32>,
        content: PostContent,
    ) -> OpResult<ObjectKey> {
        self.request(|reply| Command::Post {
            project,
            parent,
            scope,
            content,
            reply,
        })
        .await?
    }

    pub async fn post_edit(&self, key: ObjectKey, content: PostContent) -> OpResult<Version> {
        self.request(|reply| Command::Edit {
            key,
            content,
            reply,
        })
        .await?
    }

    pub async fn thread_search(&self, project: u32, parent: Option<ThreadRef>) -> OpResult<SearchId> {
        self.request(|reply| Command::ThreadSearch {
            project,
            parent,
            reply,
        })
        .await?
    }

    pub async fn time_search(&self, project: u32, since: i64) -> OpResult<SearchId> {
        self.request(|reply| Command::TimeSearch {
            project,
            since,
            reply,
        })
        .await?
    }

    pub async fn get_post(&self, owner: NodeId, key: ObjectKey) -> OpResult<Option<Post>> {
        self.request(|reply| Command::GetPost { owner, key, reply })
            .await?
    }

    /// Keep an owner's posts cached while it is shown.
    pub async fn open_view(&self, owner: NodeId) -> OpResult<()> {
        self.send(Command::OpenView(owner, true)).await
    }

    pub async fn close_view(&self, owner: NodeId) -> OpResult<()> {
        self.send(Command::OpenView(owner, false)).await
    }

    pub fn threads(&self, project: u32) -> Vec<PostSummary> {
        board::threads(&self.board.read(), project)
    }

    pub fn replies(&self, thread: ThreadRef, project: u32) -> Vec<PostSummary> {
        board::replies(&self.board.read(), thread, project)
    }

    /// Report a finished download started through [`Transfers`].
    pub async fn download_complete(
        &self,
        service: ServiceTag,
        ticket: DownloadTicket,
        result: OpResult<()>,
    ) -> OpResult<()> {
        self.send(Command::DownloadComplete {
            service,
            ticket,
            result,
        })
        .await
    }

    /// Local path of a payload, for the transfer component to serve.
    pub async fn file_request(&self, owner: NodeId, details: FileDetails) -> OpResult<Option<PathBuf>> {
        self.request(|reply| Command::FileRequest {
            owner,
            details,
            reply,
        })
        .await
    }

    pub async fn info(&self) -> OpResult<NodeInfo> {
        self.request(Command::Info).await
    }

    /// Flush caches, remember contacts and stop the loop.
    pub async fn shutdown(&self) -> OpResult<()> {
        self.request(Command::Shutdown).await
    }
}

/// State owned by the core task
pub struct Node {
    store: ObjectStore,
    transport: UdpTransport,
    storage: Storage,
    events: broadcast::Sender<NodeEvent>,
    sealed_tx: mpsc::UnboundedSender<Sealed>,
    established: bool,
}

impl Node {
    /// Open storage, bind the transport, load caches and spawn the core task.
    pub async fn start(options: NodeOptions) -> OpResult<(NodeHandle, JoinHandle<()>)> {
        options.config.validate()?;
        let storage = Storage::open_in(&options.data_dir)?;
        let keypair = storage.load_or_create_identity()?;
        let file_key = storage.load_or_create_file_key()?;
        let local_id = keypair.node_id();

        let transport = UdpTransport::bind(options.bind_ip, &options.config, local_id).await?;
        let max_retries = options.config.max_receive_retries;
        let tick_interval = options.config.tick_interval();

        let ctx = StoreContext::new(
            keypair,
            options.config,
            file_key,
            &options.data_dir,
            options.trust,
            options.transfers,
        );
        let mut board = Board::new(&ctx);
        if let Err(err) = board.load(&ctx) {
            warn!(error = %err, "board cache could not be loaded, starting empty");
        }
        let board_reader = board.reader();
        let mut store = ObjectStore::new(ctx);
        store.register(Box::new(board));

        let remembered = storage.load_peers().unwrap_or_else(|err| {
            warn!(error = %err, "could not read remembered peers");
            Vec::new()
        });
        for peer in &remembered {
            store.bootstrap(peer.addr);
        }

        let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (sealed_tx, sealed_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(16);
        let receiver = transport.spawn_receiver(inbound_tx, max_retries);

        let handle = NodeHandle {
            id: local_id,
            addr: transport.local_addr(),
            commands,
            events: events.clone(),
            board: board_reader,
        };
        let node = Node {
            store,
            transport,
            storage,
            events,
            sealed_tx,
            established: false,
        };
        info!(node = %local_id, addr = %handle.addr, peers = remembered.len(), "node started");
        let task = tokio::spawn(node.run(command_rx, inbound_rx, sealed_rx, receiver, tick_interval));
        Ok((handle, task))
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut inbound: mpsc::Receiver<Inbound>,
        mut sealed: mpsc::UnboundedReceiver<Sealed>,
        receiver: JoinHandle<()>,
        tick_interval: std::time::Duration,
    ) {
        let mut tick = tokio::time::interval(tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.flush_outbox().await;

        let shutdown_reply = loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if let Some(reply) = self.handle_command(command) {
                            break Some(reply);
                        }
                    }
                    None => break None,
                },
                Some(packet) = inbound.recv() => {
                    self.store.handle_message(packet.addr, packet.message, now());
                }
                Some(done) = sealed.recv() => self.finish_sealed(done),
                _ = tick.tick() => self.store.tick(now()),
            }
            self.flush_outbox().await;
            self.publish_status();
        };

        self.shutdown();
        receiver.abort();
        let local_id = self.store.local_id();
        // Release the database before anyone waiting on shutdown reopens it
        drop(self);
        info!(node = %local_id, "node stopped");
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    fn board(&mut self) -> OpResult<(&mut Board, &mut StoreContext)> {
        self.store
            .service_mut::<Board>(ServiceTag::BOARD)
            .ok_or(OpError::UnknownService(ServiceTag::BOARD.0))
    }

    /// Run one command; returns the reply channel when it asks the loop to stop.
    fn handle_command(&mut self, command: Command) -> Option<oneshot::Sender<()>> {
        match command {
            Command::Bootstrap(addr) => self.store.bootstrap(addr),
            Command::Post {
                project,
                parent,
                scope,
                content,
                reply,
            } => {
                let tx = self.sealed_tx.clone();
                tokio::task::spawn_blocking(move || {
                    let _ = tx.send(Sealed::Post {
                        project,
                        parent,
                        scope,
                        payload: content.seal(),
                        reply,
                    });
                });
            }
            Command::Edit {
                key,
                content,
                reply,
            } => {
                let tx = self.sealed_tx.clone();
                tokio::task::spawn_blocking(move || {
                    let _ = tx.send(Sealed::Edit {
                        key,
                        payload: content.seal(),
                        reply,
                    });
                });
            }
            Command::ThreadSearch {
                project,
                parent,
                reply,
            } => {
                let result = self
                    .board()
                    .and_then(|(board, ctx)| board.thread_search(ctx, project, parent));
                let _ = reply.send(result);
            }
            Command::TimeSearch {
                project,
                since,
                reply,
            } => {
                let result = self
                    .board()
                    .and_then(|(board, ctx)| board.time_search(ctx, project, since));
                let _ = reply.send(result);
            }
            Command::GetPost { owner, key, reply } => {
                let result = self
                    .board()
                    .and_then(|(board, ctx)| board.get_post(ctx, owner, &key));
                let _ = reply.send(result);
            }
            Command::OpenView(owner, open) => {
                if let Ok((board, _)) = self.board() {
                    if open {
                        board.open_view(owner);
                    } else {
                        board.close_view(owner);
                    }
                }
            }
            Command::DownloadComplete {
                service,
                ticket,
                result,
            } => self.store.download_complete(service, ticket, result),
            Command::FileRequest {
                owner,
                details,
                reply,
            } => {
                let _ = reply.send(self.store.file_request(owner, &details));
            }
            Command::Info(reply) => {
                let ctx = self.store.context();
                let _ = reply.send(NodeInfo {
                    id: ctx.local_id(),
                    addr: self.transport.local_addr(),
                    contacts: ctx.routing.len(),
                    established: ctx.is_established(),
                    live_searches: ctx.searches.len(),
                });
            }
            Command::Shutdown(reply) => return Some(reply),
        }
        None
    }

    fn finish_sealed(&mut self, sealed: Sealed) {
        match sealed {
            Sealed::Post {
                project,
                parent,
                scope,
                payload,
                reply,
            } => {
                let result = payload.and_then(|payload| {
                    let (board, ctx) = self.board()?;
                    board.post_message(ctx, project, parent, scope, payload)
                });
                let _ = reply.send(result);
            }
            Sealed::Edit {
                key,
                payload,
                reply,
            } => {
                let result = payload.and_then(|payload| {
                    let (board, ctx) = self.board()?;
                    board.post_edit(ctx, &key, payload)
                });
                let _ = reply.send(result);
            }
        }
    }

    async fn flush_outbox(&mut self) {
        for outbound in self.store.drain_outbox() {
            if let Err(err) = self.transport.send(&outbound).await {
                warn!(addr = %outbound.addr, kind = outbound.packet.kind().as_str(), error = %err, "send failed");
            }
        }
    }

    fn publish_status(&mut self) {
        let established = self.store.context().is_established();
        if established != self.established {
            self.established = established;
            let _ = self.events.send(NodeEvent::StatusChanged { established });
        }
    }

    fn shutdown(&mut self) {
        if let Ok((board, _)) = self.board() {
            board.flush();
        }
        let contacts: Vec<ContactInfo> = self
            .store
            .context()
            .routing
            .contacts()
            .map(|c| ContactInfo {
                id: c.id,
                addr: c.addr,
            })
            .collect();
        match self.storage.save_peers(&contacts) {
            Ok(()) => debug!(count = contacts.len(), "remembered contacts"),
            Err(err) => warn!(error = %err, "could not save contacts"),
        }
    }
}

fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

/// Options for a node in `data_dir` with no transfer component or hierarchy
pub fn default_options(data_dir: impl AsRef<Path>, config: NodeConfig, bind_ip: IpAddr) -> NodeOptions {
    NodeOptions {
        data_dir: data_dir.as_ref().to_path_buf(),
        config,
        bind_ip,
        transfers: Arc::new(NullTransfers),
        trust: Arc::new(NoTrust),
    }
}
