//! End-to-end tests: a real pool, host sessions and client sessions talking
//! over in-process transports.
//!
//! Each session gets its own connection to the pool, exactly as a separate
//! process would. The Ethereum nodes are `FakeNode`s, so the assertions are
//! on the peer-management calls each session ends up making.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;
use vipnode_agent::{Call, ClientSession, FakeNode, HostSession};
use vipnode_pool::{Pool, PoolOptions, RemotePool, Signer, METHOD_PREFIX};
use vipnode_store::{MemoryStore, Store, KEEPALIVE_INTERVAL};
use vipnode_types::config::WhitelistPolicy;
use vipnode_types::Node;
use vipnode_wire::{serve_pipe, Framing, IoCodec, Remote};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

fn new_pool(policy: WhitelistPolicy) -> Arc<Pool> {
    let options = PoolOptions {
        whitelist_policy: policy,
        whitelist_timeout: Duration::from_secs(2),
        ..PoolOptions::default()
    };
    Arc::new(Pool::new(Arc::new(MemoryStore::new()), options))
}

/// Open a connection to `pool`. Returns the caller's end.
fn dial(pool: &Arc<Pool>) -> Arc<Remote> {
    let (pool_side, caller_side) = serve_pipe();
    pool_side
        .server()
        .register(METHOD_PREFIX, pool.clone(), &[])
        .unwrap();
    caller_side
}

struct TestHost {
    node: Arc<FakeNode>,
    session: Arc<HostSession>,
    pool: Arc<RemotePool>,
    uri: String,
}

fn new_host(pool: &Arc<Pool>) -> TestHost {
    let signer = Signer::generate();
    let uri = format!("enode://{}@10.0.0.1:30303", signer.node_id());
    let node = Arc::new(FakeNode::new(signer.node_id()));
    let session = Arc::new(HostSession::new(node.clone(), uri.clone(), "0xpayout"));
    let remote = dial(pool);
    remote
        .server()
        .register(METHOD_PREFIX, session.clone(), &[])
        .unwrap();
    let pool = Arc::new(RemotePool::new(remote.client().clone(), signer));
    TestHost {
        node,
        session,
        pool,
        uri,
    }
}

struct TestClient {
    id: String,
    node: Arc<FakeNode>,
    session: Arc<ClientSession>,
    pool: Arc<RemotePool>,
}

fn new_client(pool: &Arc<Pool>) -> TestClient {
    let signer = Signer::generate();
    let id = signer.node_id().to_string();
    let node = Arc::new(FakeNode::new(&id));
    let session = Arc::new(ClientSession::new(node.clone()));
    let pool = Arc::new(RemotePool::new(dial(pool).client().clone(), signer));
    TestClient {
        id,
        node,
        session,
        pool,
    }
}

fn count(calls: &[Call], method: &str) -> usize {
    calls.iter().filter(|c| c.method == method).count()
}

// ---------------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_pool_host_client() {
    let pool = new_pool(WhitelistPolicy::Require);
    let host = new_host(&pool);
    assert_ok!(host.session.start(host.pool.clone()).await);

    let client = new_client(&pool);
    assert_ok!(client.session.start(client.pool.clone()).await);

    assert_eq!(host.node.calls(), vec![Call::new("add_trusted_peer", &client.id)]);
    assert_eq!(client.node.calls(), vec![Call::new("connect_peer", &host.uri)]);

    client.session.stop();
    assert_ok!(client.session.wait().await);
    assert_eq!(
        client.node.calls(),
        vec![
            Call::new("connect_peer", &host.uri),
            Call::new("disconnect_peer", &host.uri),
        ]
    );
    assert_eq!(host.node.calls().len(), 1);

    // A second cycle repeats every call; nothing is deduplicated.
    assert_ok!(client.session.start(client.pool.clone()).await);
    client.session.stop();
    assert_ok!(client.session.wait().await);

    let client_calls = client.node.calls();
    assert_eq!(count(&client_calls, "connect_peer"), 2);
    assert_eq!(count(&client_calls, "disconnect_peer"), 2);
    assert_eq!(
        host.node.calls(),
        vec![
            Call::new("add_trusted_peer", &client.id),
            Call::new("add_trusted_peer", &client.id),
        ]
    );

    host.session.stop();
    assert_ok!(host.session.wait().await);
}

#[tokio::test]
async fn test_client_gets_only_active_hosts_of_its_kind() {
    let pool = new_pool(WhitelistPolicy::Skip);
    let store = pool.store();
    store.set_node(Node::host("foo", "enode://foo", "geth"), "").unwrap();
    store.set_node(Node::host("bar", "enode://bar", "parity"), "").unwrap();
    let mut stale = Node::host("oldpeer", "enode://oldpeer", "parity");
    stale.last_seen = Utc::now() - chrono::Duration::from_std(KEEPALIVE_INTERVAL * 10).unwrap();
    store.set_node(stale, "").unwrap();

    let active: Vec<String> = store
        .active_hosts("", 3)
        .unwrap()
        .into_iter()
        .map(|n| n.id)
        .collect();
    assert_eq!(active.len(), 2);
    assert!(active.contains(&"foo".to_string()));
    assert!(active.contains(&"bar".to_string()));

    let client = new_client(&pool);
    assert_ok!(client.session.start(client.pool.clone()).await);
    assert_eq!(client.node.calls(), vec![Call::new("connect_peer", "enode://foo")]);
    client.session.stop();
    assert_ok!(client.session.wait().await);
}

#[tokio::test]
async fn test_client_without_hosts_fails_to_start() {
    let pool = new_pool(WhitelistPolicy::Require);
    let client = new_client(&pool);
    let err = client.session.start(client.pool.clone()).await.unwrap_err();
    assert!(matches!(err, vipnode_types::VipnodeError::NoHostsAvailable(_)));
    assert!(client.node.calls().is_empty());
}

#[tokio::test]
async fn test_stopped_host_refuses_whitelist() {
    let pool = new_pool(WhitelistPolicy::Require);
    let host = new_host(&pool);
    assert_ok!(host.session.start(host.pool.clone()).await);
    host.session.stop();
    assert_ok!(host.session.wait().await);

    // The pool still lists the host, but the host no longer accepts clients.
    let client = new_client(&pool);
    let err = client.session.start(client.pool.clone()).await.unwrap_err();
    assert!(matches!(err, vipnode_types::VipnodeError::NoHostsAvailable(_)));
    assert!(host.node.calls().is_empty());
}

#[tokio::test]
async fn test_cluster_stats() {
    let pool = new_pool(WhitelistPolicy::Require);
    let mut hosts = Vec::new();
    for _ in 0..4 {
        let host = new_host(&pool);
        assert_ok!(host.session.start(host.pool.clone()).await);
        hosts.push(host);
    }
    let client = new_client(&pool);
    assert_ok!(client.session.start(client.pool.clone()).await);
    assert_eq!(client.session.peers().len(), 3);

    let stats = pool.store().stats().unwrap();
    assert_eq!(stats.num_active_hosts, 4);
    assert_eq!(stats.num_active_clients, 1);
    assert_eq!(pool.num_host_channels(), 4);

    client.session.stop();
    assert_ok!(client.session.wait().await);
    for host in &hosts {
        host.session.stop();
        assert_ok!(host.session.wait().await);
    }
    let trusted: usize = hosts.iter().map(|h| count(&h.node.calls(), "add_trusted_peer")).sum();
    assert_eq!(trusted, 3);
}

// ---------------------------------------------------------------------------
// Transport shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_close_host() {
    let pool = new_pool(WhitelistPolicy::Require);
    let (pool_io, host_io) = tokio::io::duplex(64 * 1024);

    let (reader, writer) = tokio::io::split(pool_io);
    let pool_remote = Arc::new(Remote::new(Arc::new(IoCodec::new(
        reader,
        writer,
        Framing::LengthPrefixed,
    ))));
    pool_remote
        .server()
        .register(METHOD_PREFIX, pool.clone(), &[])
        .unwrap();
    let serving = pool_remote.clone();
    let pool_serve = tokio::spawn(async move { serving.serve().await });

    let (reader, writer) = tokio::io::split(host_io);
    let host_remote = Arc::new(Remote::new(Arc::new(IoCodec::new(
        reader,
        writer,
        Framing::LengthPrefixed,
    ))));
    let serving = host_remote.clone();
    tokio::spawn(async move { serving.serve().await });

    let signer = Signer::generate();
    let node = Arc::new(FakeNode::new(signer.node_id()));
    let session = Arc::new(HostSession::new(
        node.clone(),
        format!("enode://{}@10.0.0.2:30303", signer.node_id()),
        "",
    ));
    host_remote
        .server()
        .register(METHOD_PREFIX, session.clone(), &[])
        .unwrap();
    let remote_pool = Arc::new(RemotePool::new(host_remote.client().clone(), signer));
    assert_ok!(session.start(remote_pool).await);
    assert_eq!(pool.num_host_channels(), 1);

    assert_ok!(host_remote.close().await);

    let served = tokio::time::timeout(Duration::from_secs(5), pool_serve)
        .await
        .expect("pool serve loop did not exit")
        .unwrap();
    let err = served.unwrap_err();
    assert!(err.is_closed(), "expected a closed error, got {err:?}");

    session.stop();
    tokio::time::timeout(Duration::from_secs(5), session.wait())
        .await
        .expect("host shutdown deadlocked")
        .unwrap();
    assert_eq!(pool.num_host_channels(), 0);
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_host_keeps_trusting_peers_the_pool_knows() {
    let pool = new_pool(WhitelistPolicy::Skip);
    let signer = Signer::generate();
    let node = Arc::new(FakeNode::new(signer.node_id()));
    let session = Arc::new(
        HostSession::new(
            node.clone(),
            format!("enode://{}@10.0.0.1:30303", signer.node_id()),
            "",
        )
        .with_keepalive_interval(Duration::from_millis(20)),
    );
    let remote = dial(&pool);
    remote
        .server()
        .register(METHOD_PREFIX, session.clone(), &[])
        .unwrap();
    assert_ok!(
        session
            .start(Arc::new(RemotePool::new(remote.client().clone(), signer)))
            .await
    );

    let client = new_client(&pool);
    assert_ok!(client.session.start(client.pool.clone()).await);

    // The node reports peers by enode ID, the same ID each peer signs with.
    let stranger = "ab".repeat(64);
    node.set_peers(vec![client.id.clone(), stranger.clone()]);
    tokio::time::sleep(Duration::from_millis(120)).await;
    session.stop();
    assert_ok!(session.wait().await);

    let calls = node.calls();
    assert!(!calls.contains(&Call::new("remove_trusted_peer", &client.id)));
    assert!(calls.contains(&Call::new("remove_trusted_peer", &stranger)));

    client.session.stop();
    assert_ok!(client.session.wait().await);
}

