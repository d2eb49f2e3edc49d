//! [`EthNode`] over a node's own JSON-RPC endpoint (usually its IPC socket).

use super::EthNode;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};
use vipnode_types::{NodeUri, VipnodeError, VipnodeResult};
use vipnode_wire::{Client, Remote, WireError};

/// Node implementations with known peer-management APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Geth,
    Parity,
}

impl NodeKind {
    /// Detect the implementation from a `web3_clientVersion` string.
    pub fn detect(client_version: &str) -> VipnodeResult<Self> {
        let lower = client_version.to_ascii_lowercase();
        if lower.starts_with("geth/") {
            Ok(Self::Geth)
        } else if lower.starts_with("parity") || lower.starts_with("openethereum") {
            Ok(Self::Parity)
        } else {
            Err(VipnodeError::UnknownKind(client_version.to_string()))
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Geth => "geth",
            Self::Parity => "parity",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trusted-peer APIs take a full enode URL; only the ID is matched.
fn trusted_enode(node_id: &str) -> String {
    format!("enode://{node_id}@127.0.0.1:30303")
}

#[derive(Deserialize)]
struct GethPeer {
    #[serde(default)]
    enode: String,
    #[serde(default)]
    id: String,
}

#[derive(Deserialize)]
struct GethNodeInfo {
    enode: String,
}

#[derive(Deserialize)]
struct ParityPeers {
    #[serde(default)]
    peers: Vec<ParityPeer>,
}

#[derive(Deserialize)]
struct ParityPeer {
    #[serde(default)]
    id: Option<String>,
}

/// A real node reached over JSON-RPC.
pub struct RpcNode {
    client: Arc<Client>,
    kind: NodeKind,
}

impl RpcNode {
    /// Connect to a node's IPC socket and detect its implementation.
    #[cfg(unix)]
    pub async fn connect_ipc(path: &std::path::Path) -> VipnodeResult<Self> {
        use vipnode_wire::{Framing, IoCodec};

        let stream = tokio::net::UnixStream::connect(path).await?;
        let remote = Arc::new(Remote::new(Arc::new(IoCodec::from_unix(stream, Framing::Lines))));
        let serving = remote.clone();
        tokio::spawn(async move {
            if let Err(e) = serving.serve().await {
                debug!(error = %e, "Node IPC connection ended");
            }
        });
        let node = Self::detect(remote.client().clone()).await?;
        info!(path = %path.display(), kind = %node.kind, "Connected to node");
        Ok(node)
    }

    #[cfg(not(unix))]
    pub async fn connect_ipc(path: &std::path::Path) -> VipnodeResult<Self> {
        Err(VipnodeError::Config(format!(
            "IPC sockets are not supported on this platform: {}",
            path.display()
        )))
    }

    /// Ask the node what it is.
    pub async fn detect(client: Arc<Client>) -> VipnodeResult<Self> {
        let version: String = client
            .call("web3_clientVersion", ())
            .await
            .map_err(|e| node_err("web3_clientVersion", e))?;
        let kind = NodeKind::detect(&version)?;
        Ok(Self { client, kind })
    }

    pub fn node_kind(&self) -> NodeKind {
        self.kind
    }

    /// The node's own enode URI, as it advertises itself on devp2p.
    pub async fn enode(&self) -> VipnodeResult<NodeUri> {
        let enode = match self.kind {
            NodeKind::Geth => {
                let info: GethNodeInfo = self
                    .client
                    .call("admin_nodeInfo", ())
                    .await
                    .map_err(|e| node_err("admin_nodeInfo", e))?;
                info.enode
            }
            NodeKind::Parity => self
                .client
                .call("parity_enode", ())
                .await
                .map_err(|e| node_err("parity_enode", e))?,
        };
        NodeUri::parse(&enode)
    }

    /// Call a method whose result is a success flag.
    async fn call_ok(&self, method: &str, arg: &str) -> VipnodeResult<()> {
        let result: Value = self
            .client
            .call(method, [arg])
            .await
            .map_err(|e| node_err(method, e))?;
        if result == Value::Bool(false) {
            return Err(VipnodeError::NodeCall(format!("{method}({arg}) returned false")));
        }
        Ok(())
    }
}

fn node_err(method: &str, e: WireError) -> VipnodeError {
    VipnodeError::NodeCall(format!("{method}: {e}"))
}

#[async_trait]
impl EthNode for RpcNode {
    fn kind(&self) -> &str {
        self.kind.as_str()
    }

    async fn add_trusted_peer(&self, node_id: &str) -> VipnodeResult<()> {
        match self.kind {
            NodeKind::Geth => self.call_ok("admin_addTrustedPeer", &trusted_enode(node_id)).await,
            NodeKind::Parity => self.call_ok("parity_addReservedPeer", &trusted_enode(node_id)).await,
        }
    }

    async fn remove_trusted_peer(&self, node_id: &str) -> VipnodeResult<()> {
        match self.kind {
            NodeKind::Geth => self.call_ok("admin_removeTrustedPeer", &trusted_enode(node_id)).await,
            NodeKind::Parity => {
                self.call_ok("parity_removeReservedPeer", &trusted_enode(node_id))
                    .await
            }
        }
    }

    async fn connect_peer(&self, uri: &str) -> VipnodeResult<()> {
        match self.kind {
            NodeKind::Geth => self.call_ok("admin_addPeer", uri).await,
            NodeKind::Parity => self.call_ok("parity_addReservedPeer", uri).await,
        }
    }

    async fn disconnect_peer(&self, uri: &str) -> VipnodeResult<()> {
        match self.kind {
            NodeKind::Geth => self.call_ok("admin_removePeer", uri).await,
            NodeKind::Parity => self.call_ok("parity_removeReservedPeer", uri).await,
        }
    }

    async fn peers(&self) -> VipnodeResult<Vec<String>> {
        match self.kind {
            NodeKind::Geth => {
                let peers: Vec<GethPeer> = self
                    .client
                    .call("admin_peers", ())
                    .await
                    .map_err(|e| node_err("admin_peers", e))?;
                Ok(peers
                    .into_iter()
                    .filter_map(|p| match NodeUri::parse(&p.enode) {
                        Ok(uri) => Some(uri.id().to_string()),
                        Err(_) if !p.id.is_empty() => Some(p.id),
                        Err(_) => None,
                    })
                    .collect())
            }
            NodeKind::Parity => {
                let peers: ParityPeers = self
                    .client
                    .call("parity_netPeers", ())
                    .await
                    .map_err(|e| node_err("parity_netPeers", e))?;
                Ok(peers.peers.into_iter().filter_map(|p| p.id).collect())
            }
        }
    }
}
