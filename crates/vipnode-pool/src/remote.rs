//! Typed client for a pool reached over a [`vipnode_wire::Client`].

use crate::api::{PoolService, METHOD_PREFIX};
use crate::request::{SignedRequest, Signer};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use vipnode_types::{HostNode, UpdateResponse, VipnodeError, VipnodeResult};
use vipnode_wire::{Client, WireError};

/// Signs and sends pool requests on behalf of one node.
pub struct RemotePool {
    client: Arc<Client>,
    signer: Signer,
    invite: Option<String>,
    last_nonce: AtomicI64,
}

impl RemotePool {
    pub fn new(client: Arc<Client>, signer: Signer) -> Self {
        Self {
            client,
            signer,
            invite: None,
            last_nonce: AtomicI64::new(0),
        }
    }

    /// Present `token` on host registration.
    pub fn with_invite(mut self, token: impl Into<String>) -> Self {
        self.invite = Some(token.into());
        self
    }

    pub fn node_id(&self) -> &str {
        self.signer.node_id()
    }

    /// Unix time in nanoseconds, bumped so it always increases.
    fn next_nonce(&self) -> i64 {
        let now = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        let previous = self
            .last_nonce
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last.saturating_add(1)))
            })
            .unwrap_or(now);
        now.max(previous.saturating_add(1))
    }

    async fn call<R: DeserializeOwned>(&self, method: &str, args: Vec<Value>) -> VipnodeResult<R> {
        let req = SignedRequest::sign(&self.signer, method, self.next_nonce(), args);
        self.client
            .call(&format!("{METHOD_PREFIX}{method}"), req.into_params())
            .await
            .map_err(from_wire)
    }
}

/// Map a transport error onto the application taxonomy. Errors raised by the
/// pool come back as the variant it raised.
pub fn from_wire(e: WireError) -> VipnodeError {
    match e {
        WireError::Remote { code, message } => VipnodeError::from_rpc(code, &message),
        other => VipnodeError::Transport(other.to_string()),
    }
}

#[async_trait]
impl PoolService for RemotePool {
    async fn host(&self, kind: &str, payout: &str, node_uri: &str) -> VipnodeResult<()> {
        let mut args = vec![json!(kind), json!(payout), json!(node_uri)];
        if let Some(invite) = &self.invite {
            args.push(json!(invite));
        }
        self.call::<Value>("host", args).await.map(|_| ())
    }

    async fn connect(&self, kind: &str) -> VipnodeResult<Vec<HostNode>> {
        self.call("connect", vec![json!(kind)]).await
    }

    async fn update(&self, peers: &[String]) -> VipnodeResult<UpdateResponse> {
        self.call("update", vec![json!(peers)]).await
    }
}
