//! opsync CLI
//!
//! Thin wrapper around opsync-core for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Show node information
//! opsync info
//!
//! # Write a default config file
//! opsync config init
//!
//! # Run a node until Ctrl+C, joining the mesh through a known peer
//! opsync serve --port 4970 --bootstrap 203.0.113.7:4970
//!
//! # Start a thread in project 1
//! opsync post --project 1 "Subject" "Message body"
//!
//! # Reply to post 3 of another node
//! opsync post --project 1 --reply-to 3fa1c0d2e4b59a77:3 "Re: Subject" "Reply"
//!
//! # List threads, asking the network first
//! opsync threads --project 1 --bootstrap 203.0.113.7:4970
//!
//! # Show recent log entries
//! opsync logs --tail 20
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use opsync_core::board::{post_key, split_key};
use opsync_core::config::CONFIG_FILE;
use opsync_core::logging::{read_all_entries, NodeLogLayer, PACKET_TARGET};
use opsync_core::node::default_options;
use opsync_core::{
    Node, NodeConfig, NodeEvent, NodeHandle, NodeId, PostContent, PostSummary, Storage, ThreadRef,
};
use tracing_subscriber::prelude::*;

/// opsync - replicated, signed object store
#[derive(Parser)]
#[command(name = "opsync")]
#[command(version = "0.1.0")]
#[command(about = "opsync - replicated, versioned, signed object store")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Data directory (default: ~/.opsync)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show node information
    Info,

    /// Identity management
    Identity {
        #[command(subcommand)]
        action: IdentityAction,
    },

    /// Config file management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Run a node until Ctrl+C
    Serve {
        /// UDP port (overrides the config file)
        #[arg(short, long)]
        port: Option<u16>,
        /// Address to bind
        #[arg(long, default_value = "0.0.0.0")]
        bind: IpAddr,
        /// Peers to contact on start
        #[arg(short, long)]
        bootstrap: Vec<SocketAddr>,
    },

    /// Publish a board post
    Post {
        #[arg(short, long, default_value_t = 1)]
        project: u32,
        /// Thread to reply to, as <owner>:<post_id>
        #[arg(long)]
        reply_to: Option<String>,
        /// Hierarchy scope to address the post to
        #[arg(long)]
        scope: Option<u32>,
        subject: String,
        message: String,
        #[command(flatten)]
        network: NetworkArgs,
    },

    /// Replace the content of one of our posts
    Edit {
        #[arg(short, long, default_value_t = 1)]
        project: u32,
        post_id: u32,
        subject: String,
        message: String,
        #[command(flatten)]
        network: NetworkArgs,
    },

    /// List thread roots of a project
    Threads {
        #[arg(short, long, default_value_t = 1)]
        project: u32,
        #[command(flatten)]
        network: NetworkArgs,
    },

    /// List replies in a thread
    Replies {
        /// Thread as <owner>:<post_id>
        thread: String,
        #[arg(short, long, default_value_t = 1)]
        project: u32,
        #[command(flatten)]
        network: NetworkArgs,
    },

    /// Show entries from the node's JSONL logs
    Logs {
        /// Only the last N entries
        #[arg(short, long)]
        tail: Option<usize>,
        /// Only packet log entries
        #[arg(long)]
        packets: bool,
    },
}

#[derive(Subcommand)]
enum IdentityAction {
    /// Show node id and public keys
    Show,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write the default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the config file in use
    Show,
}

/// Options for one-shot commands that may talk to the mesh
#[derive(clap::Args)]
struct NetworkArgs {
    /// Peers to contact before running the command
    #[arg(short, long)]
    bootstrap: Vec<SocketAddr>,
    /// Seconds to wait for the network
    #[arg(long, default_value_t = 5)]
    wait: u64,
}

impl Commands {
    /// Commands that run a node and so write to the node log
    fn runs_node(&self) -> bool {
        matches!(
            self,
            Commands::Serve { .. }
                | Commands::Post { .. }
                | Commands::Edit { .. }
                | Commands::Threads { .. }
                | Commands::Replies { .. }
        )
    }
}

fn setup_logging(verbosity: u8, node_log: Option<(PathBuf, NodeId)>) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let node_layer = node_log.and_then(|(dir, id)| match NodeLogLayer::new(dir, id.to_string()) {
        Ok(layer) => Some(layer),
        Err(err) => {
            eprintln!("warning: node log disabled: {}", err);
            None
        }
    });

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(node_layer)
        .init();
}

/// Get the default data directory (~/.opsync)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".opsync")
}

/// Parse a thread reference from `<owner hex>:<post id>`
fn parse_thread(s: &str) -> Result<ThreadRef> {
    let (owner, post_id) = s
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("Invalid thread '{}': expected <owner>:<post_id>", s))?;
    let owner = NodeId::from_hex(owner)
        .ok_or_else(|| anyhow::anyhow!("Invalid owner id '{}'", owner))?;
    let post_id = post_id
        .parse()
        .with_context(|| format!("Invalid post id '{}'", post_id))?;
    Ok(ThreadRef { owner, post_id })
}

/// Start a node for a one-shot command on an ephemeral port.
async fn start_node(data_dir: &Path, network: &NetworkArgs) -> Result<NodeHandle> {
    let mut config = NodeConfig::load(data_dir)?;
    config.port = 0;
    let bind = if network.bootstrap.is_empty() {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    };
    let (node, _task) = Node::start(default_options(data_dir, config, bind)).await?;
    if !network.bootstrap.is_empty() {
        for addr in &network.bootstrap {
            node.bootstrap(*addr).await?;
        }
        if !wait_established(&node, Duration::from_secs(network.wait)).await? {
            eprintln!("warning: no peer answered; working offline");
        }
    }
    Ok(node)
}

async fn wait_established(node: &NodeHandle, limit: Duration) -> Result<bool> {
    let mut events = node.subscribe();
    if node.info().await?.established {
        return Ok(true);
    }
    let waited = tokio::time::timeout(limit, async {
        while let Ok(event) = events.recv().await {
            if event == (NodeEvent::StatusChanged { established: true }) {
                return true;
            }
        }
        false
    })
    .await;
    Ok(waited.unwrap_or(false))
}

/// Let search results arrive before reading the cache.
async fn settle(node: &NodeHandle, network: &NetworkArgs) -> Result<()> {
    if node.info().await?.established {
        tokio::time::sleep(Duration::from_secs(network.wait.min(2))).await;
    }
    Ok(())
}

/// Print listing rows, reading each subject from the post payload.
async fn print_posts(node: &NodeHandle, rows: Vec<PostSummary>) -> Result<()> {
    for row in rows {
        let subject = match node
            .get_post(row.owner, post_key(row.project, row.post_id))
            .await?
        {
            Some(post) => post.summary.subject,
            None => row.subject,
        };
        println!(
            "  {}:{} v{} {}",
            row.owner,
            row.post_id,
            row.version,
            subject.as_deref().unwrap_or("(content not downloaded)")
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);

    // Create the identity up front so every command can show it
    let node_id = {
        let storage = Storage::open_in(&data_dir)?;
        storage.load_or_create_identity()?.node_id()
    };

    let node_log = cli
        .command
        .runs_node()
        .then(|| (data_dir.join("logs"), node_id));
    setup_logging(cli.verbose, node_log);

    match cli.command {
        Commands::Info => {
            let storage = Storage::open_in(&data_dir)?;
            let peers = storage.load_peers()?;
            let config_path = data_dir.join(CONFIG_FILE);

            println!("opsync v0.1.0");
            println!();
            println!("Node:");
            println!("  ID: {}", node_id);
            println!("  Remembered peers: {}", peers.len());
            println!();
            println!("Data directory: {}", data_dir.display());
            if config_path.exists() {
                println!("Config: {}", config_path.display());
            } else {
                println!("Config: defaults (no {})", CONFIG_FILE);
            }
        }

        Commands::Identity { action } => match action {
            IdentityAction::Show => {
                let storage = Storage::open_in(&data_dir)?;
                let keypair = storage.load_or_create_identity()?;
                let public = keypair.public_key();
                println!("Identity:");
                println!("  ID: {}", keypair.node_id());
                println!("  Signing key: {}", hex::encode(public.signing));
                println!("  Exchange key: {}", hex::encode(public.exchange));
            }
        },

        Commands::Config { action } => match action {
            ConfigAction::Init { force } => {
                let path = data_dir.join(CONFIG_FILE);
                if path.exists() && !force {
                    anyhow::bail!(
                        "Config already exists at {} (use --force to overwrite)",
                        path.display()
                    );
                }
                NodeConfig::default().save(&data_dir)?;
                println!("Wrote {}", path.display());
            }
            ConfigAction::Show => {
                let path = data_dir.join(CONFIG_FILE);
                if path.exists() {
                    let config = NodeConfig::load(&data_dir)?;
                    println!("# {}", path.display());
                    println!("{:#?}", config);
                } else {
                    println!("No config file; defaults in use:");
                    println!("{:#?}", NodeConfig::default());
                }
            }
        },

        Commands::Serve {
            port,
            bind,
            bootstrap,
        } => {
            let mut config = NodeConfig::load(&data_dir)?;
            if let Some(port) = port {
                config.port = port;
            }

            println!("Starting opsync node...");
            let (node, task) = Node::start(default_options(&data_dir, config, bind)).await?;
            let mut events = node.subscribe();
            println!();
            println!("Node:");
            println!("  ID: {}", node.local_id());
            println!("  Address: {}", node.local_addr());
            println!();

            for addr in bootstrap {
                node.bootstrap(addr).await?;
                println!("Contacting {}", addr);
            }

            println!("Data directory: {}", data_dir.display());
            println!();
            println!("Node is running. Press Ctrl+C to stop.");
            println!();

            let mut status = tokio::time::interval(Duration::from_secs(60));
            status.tick().await;
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        println!();
                        println!("Received shutdown signal...");
                        break;
                    }
                    Ok(NodeEvent::StatusChanged { established }) = events.recv() => {
                        if established {
                            println!("[Status] connected");
                        } else {
                            println!("[Status] disconnected");
                        }
                    }
                    _ = status.tick() => {
                        let info = node.info().await?;
                        println!(
                            "[Status] {} contact(s), {} search(es) running",
                            info.contacts, info.live_searches
                        );
                    }
                }
            }

            println!("Shutting down...");
            node.shutdown().await?;
            let _ = task.await;
            println!("Goodbye.");
        }

        Commands::Post {
            project,
            reply_to,
            scope,
            subject,
            message,
            network,
        } => {
            let parent = reply_to.as_deref().map(parse_thread).transpose()?;
            let node = start_node(&data_dir, &network).await?;
            let key = node
                .post_message(project, parent, scope, PostContent::new(subject, message))
                .await?;
            let established = node.info().await?.established;

            let post_id = split_key(&key).map(|(_, id)| id).unwrap_or_default();
            println!("Posted: {}:{}", node.local_id(), post_id);
            println!("  Key: {}", key);
            if !established {
                println!("  Not connected; published on the next connection.");
            }
            node.shutdown().await?;
        }

        Commands::Edit {
            project,
            post_id,
            subject,
            message,
            network,
        } => {
            let node = start_node(&data_dir, &network).await?;
            let version = node
                .post_edit(post_key(project, post_id), PostContent::new(subject, message))
                .await?;
            println!("Edited: {}:{}", node.local_id(), post_id);
            println!("  Version: {}", version);
            node.shutdown().await?;
        }

        Commands::Threads { project, network } => {
            let node = start_node(&data_dir, &network).await?;
            if node.info().await?.established {
                node.thread_search(project, None).await?;
                settle(&node, &network).await?;
            }

            let threads = node.threads(project);
            if threads.is_empty() {
                println!("No threads in project {}.", project);
            } else {
                println!("Threads ({}):", threads.len());
                print_posts(&node, threads).await?;
            }
            node.shutdown().await?;
        }

        Commands::Replies {
            thread,
            project,
            network,
        } => {
            let thread = parse_thread(&thread)?;
            let node = start_node(&data_dir, &network).await?;
            node.open_view(thread.owner).await?;
            if node.info().await?.established {
                node.thread_search(project, Some(thread)).await?;
                settle(&node, &network).await?;
            }

            let replies = node.replies(thread, project);
            if replies.is_empty() {
                println!("No replies to {}:{}.", thread.owner, thread.post_id);
            } else {
                println!("Replies ({}):", replies.len());
                print_posts(&node, replies).await?;
            }
            node.shutdown().await?;
        }

        Commands::Logs { tail, packets } => {
            let mut entries = read_all_entries(data_dir.join("logs"))?;
            if packets {
                entries.retain(|e| e.target == PACKET_TARGET);
            }
            if let Some(tail) = tail {
                let skip = entries.len().saturating_sub(tail);
                entries.drain(..skip);
            }

            if entries.is_empty() {
                println!("No log entries.");
            }
            for entry in entries {
                let fields = entry.fields.map(|f| format!(" {}", f)).unwrap_or_default();
                println!(
                    "{} {:5} {} {}{}",
                    entry.ts, entry.level, entry.target, entry.msg, fields
                );
            }
        }
    }

    Ok(())
}
