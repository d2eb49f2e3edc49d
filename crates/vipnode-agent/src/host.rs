//! Host session: offers the local node's peer slots through a pool.
//!
//! `Stopped → Starting → Registered → Stopped`. While registered the session
//! answers the pool's `whitelist` challenges by trusting the named client on
//! the local node, and keeps its registration alive with periodic `update`s.

use crate::ethnode::EthNode;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use vipnode_pool::{rpc_error, PoolService};
use vipnode_types::config::DEFAULT_KEEPALIVE_INTERVAL_SECS;
use vipnode_types::{VipnodeError, VipnodeResult};
use vipnode_wire::{CallContext, MethodHandler, RpcService};

/// Lifecycle of a [`HostSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Stopped,
    Starting,
    Registered,
}

/// A host's side of the pool protocol.
pub struct HostSession {
    node: Arc<dyn EthNode>,
    node_uri: String,
    payout: String,
    keepalive_interval: Duration,
    state: Mutex<HostState>,
    shutdown_tx: Mutex<Option<watch::Sender<bool>>>,
    task: Mutex<Option<JoinHandle<VipnodeResult<()>>>>,
}

impl HostSession {
    pub fn new(node: Arc<dyn EthNode>, node_uri: impl Into<String>, payout: impl Into<String>) -> Self {
        Self {
            node,
            node_uri: node_uri.into(),
            payout: payout.into(),
            keepalive_interval: Duration::from_secs(DEFAULT_KEEPALIVE_INTERVAL_SECS),
            state: Mutex::new(HostState::Stopped),
            shutdown_tx: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn state(&self) -> HostState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: HostState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Register with `pool` and start the keepalive loop.
    ///
    /// Every call is a fresh registration; a restarted session registers again.
    /// The previous loop must have been collected with [`wait`](Self::wait).
    /// A [`stop`](Self::stop) that lands while registration is in flight makes
    /// this return [`VipnodeError::InvalidState`] with the session stopped.
    pub async fn start(self: &Arc<Self>, pool: Arc<dyn PoolService>) -> VipnodeResult<()> {
        let shutdown_rx = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state != HostState::Stopped {
                return Err(VipnodeError::InvalidState(format!(
                    "host session is {:?}",
                    *state
                )));
            }
            if self.task.lock().unwrap_or_else(|e| e.into_inner()).is_some() {
                return Err(VipnodeError::InvalidState(
                    "previous keepalive loop has not been waited on".to_string(),
                ));
            }
            *state = HostState::Starting;
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            *self.shutdown_tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(shutdown_tx);
            shutdown_rx
        };

        if let Err(e) = pool.host(self.node.kind(), &self.payout, &self.node_uri).await {
            self.shutdown_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
            self.set_state(HostState::Stopped);
            return Err(e);
        }

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *shutdown_rx.borrow() {
            *state = HostState::Stopped;
            return Err(VipnodeError::InvalidState(
                "host session stopped while starting".to_string(),
            ));
        }
        let task = tokio::spawn(keepalive(
            self.node.clone(),
            pool,
            self.keepalive_interval,
            shutdown_rx,
        ));
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        *state = HostState::Registered;
        info!(uri = %self.node_uri, kind = %self.node.kind(), "Host registered with pool");
        Ok(())
    }

    /// Answer a pool challenge: let `client_id` connect to the local node.
    pub async fn whitelist(&self, client_id: &str) -> VipnodeResult<()> {
        let state = self.state();
        if state != HostState::Registered {
            return Err(VipnodeError::InvalidState(format!(
                "whitelist request while {state:?}"
            )));
        }
        self.node.add_trusted_peer(client_id).await?;
        info!(client_id = %client_id, "Whitelisted client");
        Ok(())
    }

    /// Signal the keepalive loop to exit. Safe to call when already stopped.
    ///
    /// While `Starting`, the pending [`start`](Self::start) rolls back instead.
    pub fn stop(&self) {
        if let Some(tx) = self.shutdown_tx.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = tx.send(true);
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == HostState::Registered {
            *state = HostState::Stopped;
        }
    }

    /// Wait for the keepalive loop to exit and return its result.
    pub async fn wait(&self) -> VipnodeResult<()> {
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        match task {
            Some(task) => task
                .await
                .map_err(|e| VipnodeError::InvalidState(format!("keepalive task failed: {e}")))?,
            None => Ok(()),
        }
    }
}

async fn keepalive(
    node: Arc<dyn EthNode>,
    pool: Arc<dyn PoolService>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> VipnodeResult<()> {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = update_once(node.as_ref(), pool.as_ref()).await {
                    warn!(error = %e, "Host keepalive failed");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("Host keepalive stopped");
                    return Ok(());
                }
            }
        }
    }
}

async fn update_once(node: &dyn EthNode, pool: &dyn PoolService) -> VipnodeResult<()> {
    let peers = node.peers().await?;
    let resp = pool.update(&peers).await?;
    for peer in &resp.invalid_peers {
        match node.remove_trusted_peer(peer).await {
            Ok(()) => debug!(node_id = %peer, "Untrusted peer the pool no longer knows"),
            Err(e) => warn!(node_id = %peer, error = %e, "Failed to untrust peer"),
        }
    }
    Ok(())
}

impl RpcService for HostSession {
    fn method_handlers(self: Arc<Self>) -> Vec<(&'static str, MethodHandler)> {
        vec![(
            "whitelist",
            MethodHandler::new(move |_ctx: CallContext, (client_id,): (String,)| {
                let host = self.clone();
                async move { host.whitelist(&client_id).await.map_err(rpc_error) }
            }),
        )]
    }
}
