//! The matching service.

use crate::api::WHITELIST_METHOD;
use crate::request::SignedRequest;
use dashmap::DashMap;
use futures::future::join_all;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use vipnode_store::{Clock, Store, SystemClock};
use vipnode_types::config::{PoolConfig, WhitelistPolicy};
use vipnode_types::{HostNode, Node, NodeUri, UpdateResponse, VipnodeError, VipnodeResult};
use vipnode_wire::{CallContext, Client, ErrorObject, MethodHandler, RpcService};

/// Matching policy, taken from [`PoolConfig`].
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub whitelist_policy: WhitelistPolicy,
    pub whitelist_timeout: Duration,
    pub max_hosts_per_connect: usize,
    pub kinds: Vec<String>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self::from(&PoolConfig::default())
    }
}

impl From<&PoolConfig> for PoolOptions {
    fn from(config: &PoolConfig) -> Self {
        Self {
            whitelist_policy: config.whitelist_policy,
            whitelist_timeout: config.whitelist_timeout(),
            max_hosts_per_connect: config.max_hosts_per_connect,
            kinds: config.kinds.clone(),
        }
    }
}

/// Registers hosts, matches clients to them and answers keepalives.
///
/// Hosts are reverse-called over the connection they registered on; those
/// channels are kept in `hosts`, keyed by node ID.
pub struct Pool {
    store: Arc<dyn Store>,
    options: PoolOptions,
    hosts: DashMap<String, Arc<Client>>,
    clock: Arc<dyn Clock>,
}

impl Pool {
    pub fn new(store: Arc<dyn Store>, options: PoolOptions) -> Self {
        Self {
            store,
            options,
            hosts: DashMap::new(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    /// Hosts the pool can currently reverse-call.
    pub fn num_host_channels(&self) -> usize {
        self.hosts.iter().filter(|e| !e.value().is_closed()).count()
    }

    fn authenticate(&self, method: &str, req: &SignedRequest) -> VipnodeResult<()> {
        req.verify(method)?;
        self.store.check_and_save_nonce(&req.node_id, req.nonce)
    }

    fn check_kind(&self, kind: &str) -> VipnodeResult<()> {
        if self.options.kinds.iter().any(|k| k == kind) {
            Ok(())
        } else {
            Err(VipnodeError::UnknownKind(kind.to_string()))
        }
    }

    /// `host(kind, payout, node_uri[, invite])`
    pub async fn host(&self, ctx: &CallContext, req: SignedRequest) -> VipnodeResult<()> {
        self.authenticate("host", &req)?;
        let kind: String = req.arg(0)?;
        let payout: Option<String> = req.arg(1)?;
        let node_uri: String = req.arg(2)?;
        let invite: Option<String> = req.arg(3)?;
        self.check_kind(&kind)?;

        let mut uri = NodeUri::parse(&node_uri)?;
        if uri.id() != req.node_id {
            return Err(VipnodeError::InvalidNodeUri(format!(
                "{node_uri} does not belong to {}",
                req.node_id
            )));
        }
        if uri.remote_address().is_empty() {
            if let Some(addr) = ctx.peer_addr() {
                uri = uri.with_remote_host(addr.ip());
            }
        }

        let node = Node {
            id: req.node_id.clone(),
            uri: uri.to_string(),
            is_host: true,
            kind,
            payout: payout.unwrap_or_default(),
            last_seen: self.clock.now(),
        };
        self.store
            .set_node(node.clone(), invite.as_deref().unwrap_or_default())?;

        match ctx.peer() {
            Some(peer) => {
                self.hosts.insert(node.id.clone(), peer.clone());
            }
            None => warn!(node_id = %node.id, "Host registered without a reverse channel"),
        }
        info!(node_id = %node.id, kind = %node.kind, uri = %node.uri, "Host registered");
        Ok(())
    }

    /// `connect(kind)`
    pub async fn connect(&self, req: SignedRequest) -> VipnodeResult<Vec<HostNode>> {
        self.authenticate("connect", &req)?;
        let kind: Option<String> = req.arg(0)?;
        let kind = kind.unwrap_or_default();
        if !kind.is_empty() {
            self.check_kind(&kind)?;
        }

        self.record_client(&req.node_id, &kind)?;

        let limit = self.options.max_hosts_per_connect;
        let mut candidates: Vec<Node> = self
            .store
            .active_hosts(&kind, limit.saturating_add(1))?
            .into_iter()
            .filter(|n| n.id != req.node_id)
            .collect();
        candidates.truncate(limit);

        let hosts = match self.options.whitelist_policy {
            WhitelistPolicy::Skip => candidates.iter().map(HostNode::from).collect(),
            WhitelistPolicy::Require => self.whitelist_and_wait(&req.node_id, candidates).await,
            WhitelistPolicy::Optimistic => self.whitelist_in_background(&req.node_id, candidates),
        };
        info!(node_id = %req.node_id, kind = %kind, matched = hosts.len(), "Client matched");
        Ok(hosts)
    }

    /// `update(peers)`
    pub async fn update(&self, req: SignedRequest) -> VipnodeResult<UpdateResponse> {
        self.authenticate("update", &req)?;
        let peers: Option<Vec<String>> = req.arg(0)?;
        let peers = peers.unwrap_or_default();
        let valid = self.store.update_node_peers(&req.node_id, &peers)?;
        let invalid_peers: Vec<String> = peers.into_iter().filter(|p| !valid.contains(p)).collect();
        if !invalid_peers.is_empty() {
            debug!(node_id = %req.node_id, invalid = invalid_peers.len(), "Update reported unknown peers");
        }
        Ok(UpdateResponse { invalid_peers })
    }

    fn record_client(&self, id: &str, kind: &str) -> VipnodeResult<()> {
        match self.store.get_node(id)? {
            // A host asking for peers stays a host; only its liveness moves.
            Some(existing) if existing.is_host => {
                self.store.update_node_peers(id, &[])?;
            }
            _ => {
                let mut node = Node::client(id, kind);
                node.last_seen = self.clock.now();
                self.store.set_node(node, "")?;
            }
        }
        Ok(())
    }

    fn channel(&self, host_id: &str) -> Option<Arc<Client>> {
        let client = self.hosts.get(host_id).map(|e| e.value().clone())?;
        if client.is_closed() {
            self.drop_channel(host_id, &client);
            return None;
        }
        Some(client)
    }

    /// The live channel to a whitelist candidate; a host without one is
    /// skipped with [`VipnodeError::NoRemote`].
    fn reverse_channel(&self, host_id: &str) -> Option<Arc<Client>> {
        let channel = self.channel(host_id);
        if channel.is_none() {
            warn!(
                node_id = %host_id,
                error = %VipnodeError::NoRemote(host_id.to_string()),
                "Skipping host"
            );
        }
        channel
    }

    fn drop_channel(&self, host_id: &str, client: &Arc<Client>) {
        if self
            .hosts
            .remove_if(host_id, |_, c| Arc::ptr_eq(c, client))
            .is_some()
        {
            debug!(node_id = %host_id, "Dropped closed host channel");
        }
    }

    async fn whitelist_and_wait(&self, client_id: &str, candidates: Vec<Node>) -> Vec<HostNode> {
        let timeout = self.options.whitelist_timeout;
        let mut pending = Vec::with_capacity(candidates.len());
        for node in candidates {
            let Some(channel) = self.reverse_channel(&node.id) else {
                continue;
            };
            pending.push(async move {
                let result = channel
                    .call_timeout::<_, Value>(WHITELIST_METHOD, (client_id,), timeout)
                    .await;
                (node, channel, result)
            });
        }

        let mut accepted = Vec::new();
        for (node, channel, result) in join_all(pending).await {
            match result {
                Ok(_) => {
                    debug!(node_id = %node.id, client_id = %client_id, "Whitelist acknowledged");
                    accepted.push(HostNode::from(&node));
                }
                Err(e) => {
                    warn!(node_id = %node.id, client_id = %client_id, error = %e, "Whitelist failed");
                    if e.is_closed() {
                        self.drop_channel(&node.id, &channel);
                    }
                }
            }
        }
        accepted
    }

    fn whitelist_in_background(&self, client_id: &str, candidates: Vec<Node>) -> Vec<HostNode> {
        let timeout = self.options.whitelist_timeout;
        let mut hosts = Vec::with_capacity(candidates.len());
        for node in candidates {
            let Some(channel) = self.reverse_channel(&node.id) else {
                continue;
            };
            hosts.push(HostNode::from(&node));
            let client_id = client_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = channel
                    .call_timeout::<_, Value>(WHITELIST_METHOD, (client_id.as_str(),), timeout)
                    .await
                {
                    warn!(node_id = %node.id, client_id = %client_id, error = %e, "Whitelist failed");
                }
            });
        }
        hosts
    }
}

/// Wire form of an application error; [`VipnodeError::from_rpc`] reverses it.
pub fn rpc_error(e: VipnodeError) -> ErrorObject {
    ErrorObject::new(e.code(), e.to_string())
}

impl RpcService for Pool {
    fn method_handlers(self: Arc<Self>) -> Vec<(&'static str, MethodHandler)> {
        let host = self.clone();
        let connect = self.clone();
        let update = self;
        vec![
            (
                "host",
                MethodHandler::new(move |ctx: CallContext, params: Vec<Value>| {
                    let pool = host.clone();
                    async move {
                        let req = SignedRequest::from_params(params).map_err(rpc_error)?;
                        pool.host(&ctx, req).await.map_err(rpc_error)
                    }
                }),
            ),
            (
                "connect",
                MethodHandler::new(move |_ctx: CallContext, params: Vec<Value>| {
                    let pool = connect.clone();
                    async move {
                        let req = SignedRequest::from_params(params).map_err(rpc_error)?;
                        pool.connect(req).await.map_err(rpc_error)
                    }
                }),
            ),
            (
                "update",
                MethodHandler::new(move |_ctx: CallContext, params: Vec<Value>| {
                    let pool = update.clone();
                    async move {
                        let req = SignedRequest::from_params(params).map_err(rpc_error)?;
                        pool.update(req).await.map_err(rpc_error)
                    }
                }),
            ),
        ]
    }
}
