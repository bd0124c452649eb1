//! End-to-end tests: real nodes on loopback UDP.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use opsync_core::node::default_options;
use opsync_core::{Node, NodeConfig, NodeEvent, NodeHandle, OpError, PostContent, ThreadRef};
use tempfile::TempDir;
use tokio::time::{sleep, timeout};

const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn test_config() -> NodeConfig {
    NodeConfig {
        port: 0,
        tick_interval: 100,
        ..Default::default()
    }
}

async fn start(dir: &TempDir) -> NodeHandle {
    let (handle, _task) = Node::start(default_options(dir.path(), test_config(), LOOPBACK))
        .await
        .expect("node should start");
    handle
}

/// Poll `check` until it holds or five seconds pass.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    timeout(Duration::from_secs(5), async {
        while !check() {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .is_ok()
}

#[tokio::test]
async fn test_node_reports_identity_and_address() {
    let dir = TempDir::new().unwrap();
    let node = start(&dir).await;

    let info = node.info().await.unwrap();
    assert_eq!(info.id, node.local_id());
    assert_eq!(info.addr, node.local_addr());
    assert_ne!(info.addr.port(), 0);
    assert_eq!(info.contacts, 0);
    assert!(!info.established);

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_bootstrap_establishes_both_sides() {
    let (dir_a, dir_b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let a = start(&dir_a).await;
    let b = start(&dir_b).await;
    let mut events = b.subscribe();

    b.bootstrap(a.local_addr()).await.unwrap();

    let event = timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("status event in time")
        .unwrap();
    assert_eq!(event, NodeEvent::StatusChanged { established: true });

    let mut a_contacts = 0;
    for _ in 0..100 {
        a_contacts = a.info().await.unwrap().contacts;
        if a_contacts == 1 {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(a_contacts, 1);

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_post_replicates_to_peer() {
    let (dir_a, dir_b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let a = start(&dir_a).await;
    let b = start(&dir_b).await;
    let mut events = a.subscribe();
    b.bootstrap(a.local_addr()).await.unwrap();
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("a sees b")
        .unwrap();

    a.post_message(7, None, None, PostContent::new("over the wire", "hello b"))
        .await
        .unwrap();

    let author = a.local_id();
    assert!(eventually(|| b.threads(7).iter().any(|t| t.owner == author)).await);
    let thread = &b.threads(7)[0];
    assert_eq!(thread.post_id, 1);
    assert_eq!(thread.version, 1);
    assert!(thread.parent.is_none());

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_own_post_readable_and_editable() {
    let dir = TempDir::new().unwrap();
    let node = start(&dir).await;

    let key = node
        .post_message(1, None, None, PostContent::new("first", "draft"))
        .await
        .unwrap();
    let version = node
        .post_edit(key.clone(), PostContent::new("first", "final"))
        .await
        .unwrap();
    assert_eq!(version, 2);

    let post = node.get_post(node.local_id(), key).await.unwrap().unwrap();
    assert_eq!(post.summary.version, 2);
    let content = post.content.unwrap();
    assert_eq!(content.info.subject, "first");
    assert_eq!(content.message, "final");

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_search_requires_network() {
    let dir = TempDir::new().unwrap();
    let node = start(&dir).await;

    assert!(matches!(
        node.thread_search(1, None).await,
        Err(OpError::NetworkUnestablished)
    ));
    let thread = ThreadRef {
        owner: node.local_id(),
        post_id: 1,
    };
    assert!(matches!(
        node.thread_search(1, Some(thread)).await,
        Err(OpError::NetworkUnestablished)
    ));
    assert!(matches!(
        node.time_search(1, 0).await,
        Err(OpError::NetworkUnestablished)
    ));

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_restart_keeps_identity_and_posts() {
    let dir = TempDir::new().unwrap();
    let (id, key) = {
        let node = start(&dir).await;
        let key = node
            .post_message(3, None, None, PostContent::new("kept", "across restarts"))
            .await
            .unwrap();
        let id = node.local_id();
        node.shutdown().await.unwrap();
        (id, key)
    };

    let node = start(&dir).await;
    assert_eq!(node.local_id(), id);
    let threads = node.threads(3);
    assert_eq!(threads.len(), 1);
    let post = node.get_post(id, key).await.unwrap().unwrap();
    assert_eq!(post.content.unwrap().message, "across restarts");

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_handle_fails_after_shutdown() {
    let dir = TempDir::new().unwrap();
    let node = start(&dir).await;
    node.shutdown().await.unwrap();
    sleep(Duration::from_millis(50)).await;

    assert!(matches!(node.info().await, Err(OpError::NodeStopped)));
}
