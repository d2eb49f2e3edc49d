//! Node records and the payloads exchanged with the pool.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One participating peer, as tracked by the pool's store.
///
/// Records are never deleted. A node is "active" only while its `last_seen`
/// is within the store's keepalive window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Public identity of the node (hex-encoded public key).
    pub id: String,
    /// Full `enode://` connection descriptor.
    pub uri: String,
    /// Whether the node offers peer slots.
    pub is_host: bool,
    /// Implementation tag, e.g. `geth` or `parity`.
    pub kind: String,
    /// Settlement address, hosts only.
    #[serde(default)]
    pub payout: String,
    /// Last successful interaction with the pool.
    pub last_seen: DateTime<Utc>,
}

impl Node {
    /// A host record seen just now.
    pub fn host(id: &str, uri: &str, kind: &str) -> Self {
        Self {
            id: id.to_string(),
            uri: uri.to_string(),
            is_host: true,
            kind: kind.to_string(),
            payout: String::new(),
            last_seen: Utc::now(),
        }
    }

    /// A client record seen just now.
    pub fn client(id: &str, kind: &str) -> Self {
        Self {
            id: id.to_string(),
            uri: format!("enode://{id}"),
            is_host: false,
            kind: kind.to_string(),
            payout: String::new(),
            last_seen: Utc::now(),
        }
    }
}

/// A host candidate handed to a client by `connect`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostNode {
    pub node_id: String,
    pub uri: String,
    #[serde(default)]
    pub payout: String,
}

impl From<&Node> for HostNode {
    fn from(node: &Node) -> Self {
        Self {
            node_id: node.id.clone(),
            uri: node.uri.clone(),
            payout: node.payout.clone(),
        }
    }
}

/// Result of a keepalive `update` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateResponse {
    /// Peers the caller reported that the pool no longer recognises.
    #[serde(default)]
    pub invalid_peers: Vec<String>,
}

/// Aggregate store statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub num_active_hosts: usize,
    pub num_total_hosts: usize,
    pub num_active_clients: usize,
    pub num_total_nodes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_node_from_node() {
        let mut node = Node::host("foo", "enode://foo@10.0.0.1:30303", "geth");
        node.payout = "0xabc".to_string();
        let host = HostNode::from(&node);
        assert_eq!(host.node_id, "foo");
        assert_eq!(host.uri, "enode://foo@10.0.0.1:30303");
        assert_eq!(host.payout, "0xabc");
    }

    #[test]
    fn test_update_response_defaults_missing_field() {
        let resp: UpdateResponse = serde_json::from_str("{}").unwrap();
        assert!(resp.invalid_peers.is_empty());
    }

    #[test]
    fn test_client_record_is_not_host() {
        let node = Node::client("bar", "parity");
        assert!(!node.is_host);
        assert_eq!(node.uri, "enode://bar");
    }
}
