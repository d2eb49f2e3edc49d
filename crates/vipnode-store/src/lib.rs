//! Node registry consumed by the pool.
//!
//! Records are never deleted. Liveness is derived at read time: a node is
//! active while `now - last_seen <= KEEPALIVE_INTERVAL` (inclusive).
//!
//! Two backends honor the same contract:
//! - [`MemoryStore`]: a single lock over two maps
//! - [`SqliteStore`]: durable, via rusqlite

pub mod clock;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod whitelist;

pub use clock::{Clock, ManualClock, SystemClock};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use whitelist::{invite_token, Whitelist};

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use vipnode_types::config::StoreBackend;
use vipnode_types::{Node, Stats, VipnodeResult};

/// Maximum age of `last_seen` for a node to count as active.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Storage contract for node records.
///
/// Implementations must make each call atomic with respect to the others.
pub trait Store: Send + Sync {
    /// Insert or replace a node by ID.
    ///
    /// Host records must pass the registration whitelist, using
    /// `whitelist_token` when the ID is not listed.
    fn set_node(&self, node: Node, whitelist_token: &str) -> VipnodeResult<()>;

    fn get_node(&self, id: &str) -> VipnodeResult<Option<Node>>;

    /// Accept `nonce` only if it is greater than the last one saved for `id`.
    fn check_and_save_nonce(&self, id: &str, nonce: i64) -> VipnodeResult<()>;

    /// Refresh `id`'s `last_seen` and return the subset of `peers` that are
    /// known, active nodes.
    fn update_node_peers(&self, id: &str, peers: &[String]) -> VipnodeResult<Vec<String>>;

    /// Up to `limit` active hosts, freshest first. An empty `kind` matches
    /// any kind.
    fn active_hosts(&self, kind: &str, limit: usize) -> VipnodeResult<Vec<Node>>;

    fn stats(&self) -> VipnodeResult<Stats>;
}

/// Oldest `last_seen` that still counts as active at `now`.
pub fn active_cutoff(now: DateTime<Utc>) -> DateTime<Utc> {
    now - chrono::Duration::from_std(KEEPALIVE_INTERVAL).unwrap_or(chrono::Duration::seconds(60))
}

/// Open the backend named in the pool configuration.
pub fn open(backend: &StoreBackend, whitelist: Whitelist) -> VipnodeResult<Arc<dyn Store>> {
    match backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new().with_whitelist(whitelist))),
        StoreBackend::Sqlite(path) => Ok(Arc::new(SqliteStore::open(path)?.with_whitelist(whitelist))),
    }
}

/// Behavior every backend must share. Each backend's tests run these.
#[cfg(test)]
pub(crate) mod contract {
    use super::*;
    use vipnode_types::VipnodeError;

    fn host_seen(id: &str, kind: &str, last_seen: DateTime<Utc>) -> Node {
        let mut node = Node::host(id, &format!("enode://{id}"), kind);
        node.last_seen = last_seen;
        node
    }

    pub fn keepalive_boundary_is_inclusive(store: &dyn Store, clock: &ManualClock) {
        let now = clock.now();
        let window = chrono::Duration::seconds(60);
        let epsilon = chrono::Duration::milliseconds(1);
        store.set_node(host_seen("edge", "geth", now - window), "").unwrap();
        store
            .set_node(host_seen("stale", "geth", now - window - epsilon), "")
            .unwrap();

        let ids: Vec<String> = store
            .active_hosts("", 10)
            .unwrap()
            .into_iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(ids, vec!["edge".to_string()]);
    }

    pub fn active_hosts_filters_and_limits(store: &dyn Store, clock: &ManualClock) {
        let now = clock.now();
        store.set_node(host_seen("foo", "geth", now), "").unwrap();
        store
            .set_node(host_seen("bar", "parity", now - chrono::Duration::seconds(1)), "")
            .unwrap();
        store
            .set_node(host_seen("oldpeer", "parity", now - chrono::Duration::seconds(300)), "")
            .unwrap();
        let mut client = Node::client("light", "geth");
        client.last_seen = now;
        store.set_node(client, "").unwrap();

        let all: Vec<String> = store.active_hosts("", 3).unwrap().into_iter().map(|n| n.id).collect();
        assert_eq!(all, vec!["foo".to_string(), "bar".to_string()]);

        let geth = store.active_hosts("geth", 3).unwrap();
        assert_eq!(geth.len(), 1);
        assert_eq!(geth[0].uri, "enode://foo");

        let limited = store.active_hosts("", 1).unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, "foo", "fresher nodes are kept when truncating");

        assert!(store.active_hosts("", 0).unwrap().is_empty());

        let stats = store.stats().unwrap();
        assert_eq!(stats.num_active_hosts, 2);
        assert_eq!(stats.num_total_hosts, 3);
        assert_eq!(stats.num_active_clients, 1);
        assert_eq!(stats.num_total_nodes, 4);

        // Stale records stay in storage.
        assert!(store.get_node("oldpeer").unwrap().is_some());
    }

    pub fn nonce_must_increase(store: &dyn Store) {
        store.check_and_save_nonce("foo", 10).unwrap();
        store.check_and_save_nonce("foo", 11).unwrap();
        let err = store.check_and_save_nonce("foo", 11).unwrap_err();
        assert!(matches!(err, VipnodeError::InvalidNonce(_)));
        assert!(store.check_and_save_nonce("foo", 3).is_err());
        // Independent per node.
        store.check_and_save_nonce("bar", 1).unwrap();
    }

    pub fn update_node_peers_refreshes_and_validates(store: &dyn Store, clock: &ManualClock) {
        let start = clock.now();
        store.set_node(host_seen("host", "geth", start), "").unwrap();
        store.set_node(host_seen("peer", "geth", start), "").unwrap();

        let err = store.update_node_peers("ghost", &[]).unwrap_err();
        assert!(matches!(err, VipnodeError::UnregisteredNode(_)));

        clock.advance(chrono::Duration::seconds(45));
        let valid = store
            .update_node_peers("host", &["peer".to_string(), "unknown".to_string()])
            .unwrap();
        assert_eq!(valid, vec!["peer".to_string()]);

        // "host" was refreshed, "peer" was not.
        clock.advance(chrono::Duration::seconds(30));
        let ids: Vec<String> = store.active_hosts("", 5).unwrap().into_iter().map(|n| n.id).collect();
        assert_eq!(ids, vec!["host".to_string()]);
        let valid = store.update_node_peers("host", &["peer".to_string()]).unwrap();
        assert!(valid.is_empty());
    }

    pub fn whitelist_gates_hosts_only(store: &dyn Store) {
        let err = store.set_node(Node::host("intruder", "enode://intruder", "geth"), "").unwrap_err();
        assert!(matches!(err, VipnodeError::Unauthorized(_)));
        store.set_node(Node::host("friend", "enode://friend", "geth"), "").unwrap();
        let token = invite_token("invite-secret", "invited");
        store
            .set_node(Node::host("invited", "enode://invited", "geth"), &token)
            .unwrap();
        store.set_node(Node::client("anyone", "geth"), "").unwrap();
        assert!(store.get_node("intruder").unwrap().is_none());
        assert_eq!(store.stats().unwrap().num_total_nodes, 3);
    }

    pub fn whitelist() -> Whitelist {
        Whitelist::new(["friend"], Some("invite-secret".to_string()))
    }

    pub fn set_node_replaces_by_id(store: &dyn Store) {
        store.set_node(Node::host("foo", "enode://foo", "geth"), "").unwrap();
        let mut moved = Node::host("foo", "enode://foo@10.0.0.1:30303", "geth");
        moved.payout = "0xabc".to_string();
        store.set_node(moved, "").unwrap();
        let node = store.get_node("foo").unwrap().unwrap();
        assert_eq!(node.uri, "enode://foo@10.0.0.1:30303");
        assert_eq!(node.payout, "0xabc");
        assert_eq!(store.stats().unwrap().num_total_nodes, 1);
    }
}
