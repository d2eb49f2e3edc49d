//! The local Ethereum node's peer-management capability.

mod rpc;

pub use rpc::{NodeKind, RpcNode};

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use vipnode_types::{VipnodeError, VipnodeResult};

/// Peer management on a running node. Every call is a side effect owned by
/// the node; sessions only report whether it succeeded.
#[async_trait]
pub trait EthNode: Send + Sync {
    /// Implementation tag matched against hosts, e.g. `geth`.
    fn kind(&self) -> &str;

    /// Let `node_id` connect even when peer slots are full.
    async fn add_trusted_peer(&self, node_id: &str) -> VipnodeResult<()>;

    async fn remove_trusted_peer(&self, node_id: &str) -> VipnodeResult<()>;

    /// Dial the node at `uri`.
    async fn connect_peer(&self, uri: &str) -> VipnodeResult<()>;

    async fn disconnect_peer(&self, uri: &str) -> VipnodeResult<()>;

    /// IDs of the currently connected peers.
    async fn peers(&self) -> VipnodeResult<Vec<String>>;
}

/// One recorded call on a [`FakeNode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub method: String,
    pub arg: String,
}

impl Call {
    pub fn new(method: &str, arg: &str) -> Self {
        Self {
            method: method.to_string(),
            arg: arg.to_string(),
        }
    }
}

/// An [`EthNode`] that records mutating calls instead of performing them.
#[derive(Debug)]
pub struct FakeNode {
    node_id: String,
    kind: String,
    calls: Mutex<Vec<Call>>,
    peers: Mutex<Vec<String>>,
    failing: AtomicBool,
}

impl FakeNode {
    pub fn new(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            kind: "geth".to_string(),
            calls: Mutex::new(Vec::new()),
            peers: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
        }
    }

    pub fn with_kind(mut self, kind: &str) -> Self {
        self.kind = kind.to_string();
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Calls recorded so far, in order.
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// What `peers()` reports.
    pub fn set_peers(&self, peers: Vec<String>) {
        *self.peers.lock().unwrap_or_else(|e| e.into_inner()) = peers;
    }

    /// Make every mutating call fail (after recording it).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn record(&self, method: &str, arg: &str) -> VipnodeResult<()> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Call::new(method, arg));
        if self.failing.load(Ordering::SeqCst) {
            return Err(VipnodeError::NodeCall(format!("{method}({arg}) refused")));
        }
        Ok(())
    }
}

#[async_trait]
impl EthNode for FakeNode {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn add_trusted_peer(&self, node_id: &str) -> VipnodeResult<()> {
        self.record("add_trusted_peer", node_id)
    }

    async fn remove_trusted_peer(&self, node_id: &str) -> VipnodeResult<()> {
        self.record("remove_trusted_peer", node_id)
    }

    async fn connect_peer(&self, uri: &str) -> VipnodeResult<()> {
        self.record("connect_peer", uri)
    }

    async fn disconnect_peer(&self, uri: &str) -> VipnodeResult<()> {
        self.record("disconnect_peer", uri)
    }

    async fn peers(&self) -> VipnodeResult<Vec<String>> {
        Ok(self.peers.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }
}
