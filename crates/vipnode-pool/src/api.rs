//! Pool protocol surface shared by the service and its clients.

use async_trait::async_trait;
use vipnode_types::{HostNode, UpdateResponse, VipnodeResult};

/// Namespace every pool method is registered under.
pub const METHOD_PREFIX: &str = "vipnode_";

/// Method a host exposes so the pool can ask it to trust a client.
pub const WHITELIST_METHOD: &str = "vipnode_whitelist";

/// Operations a pool offers to hosts and clients.
#[async_trait]
pub trait PoolService: Send + Sync {
    /// Register the caller as an active host.
    async fn host(&self, kind: &str, payout: &str, node_uri: &str) -> VipnodeResult<()>;

    /// Ask for hosts of `kind` to peer with. An empty kind matches any.
    async fn connect(&self, kind: &str) -> VipnodeResult<Vec<HostNode>>;

    /// Keepalive. Reports which of `peers` the pool no longer recognises.
    async fn update(&self, peers: &[String]) -> VipnodeResult<UpdateResponse>;
}
