//! Client session: keeps the local node peered with pool-matched hosts.

use crate::ethnode::EthNode;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use vipnode_pool::PoolService;
use vipnode_types::config::DEFAULT_KEEPALIVE_INTERVAL_SECS;
use vipnode_types::{HostNode, VipnodeError, VipnodeResult};

/// Default number of hosts a client stays connected to.
pub const DEFAULT_NUM_HOSTS: usize = 3;

/// Lifecycle of a [`ClientSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Stopped,
    Connecting,
    Connected,
}

/// A client's side of the pool protocol.
///
/// `start` connects the local node to the hosts the pool hands out; the
/// background loop then sends keepalives, drops hosts the pool no longer
/// vouches for and tops up from a fresh `connect`. On `stop` the loop
/// disconnects every host before it exits.
pub struct ClientSession {
    node: Arc<dyn EthNode>,
    num_hosts: usize,
    keepalive_interval: Duration,
    state: Mutex<ClientState>,
    peers: Mutex<Vec<HostNode>>,
    shutdown_tx: Mutex<Option<watch::Sender<bool>>>,
    task: Mutex<Option<JoinHandle<VipnodeResult<()>>>>,
}

impl ClientSession {
    pub fn new(node: Arc<dyn EthNode>) -> Self {
        Self {
            node,
            num_hosts: DEFAULT_NUM_HOSTS,
            keepalive_interval: Duration::from_secs(DEFAULT_KEEPALIVE_INTERVAL_SECS),
            state: Mutex::new(ClientState::Stopped),
            peers: Mutex::new(Vec::new()),
            shutdown_tx: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn with_num_hosts(mut self, num_hosts: usize) -> Self {
        self.num_hosts = num_hosts.max(1);
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn state(&self) -> ClientState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ClientState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Hosts the local node is currently peered with.
    pub fn peers(&self) -> Vec<HostNode> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn num_peers(&self) -> usize {
        self.peers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Ask `pool` for hosts, peer with them and start the keepalive loop.
    ///
    /// A [`stop`](Self::stop) that lands while hosts are being connected
    /// disconnects them again and makes this return
    /// [`VipnodeError::InvalidState`] with the session stopped.
    pub async fn start(self: &Arc<Self>, pool: Arc<dyn PoolService>) -> VipnodeResult<()> {
        let shutdown_rx = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state != ClientState::Stopped {
                return Err(VipnodeError::InvalidState(format!(
                    "client session is {:?}",
                    *state
                )));
            }
            if self.task.lock().unwrap_or_else(|e| e.into_inner()).is_some() {
                return Err(VipnodeError::InvalidState(
                    "previous keepalive loop has not been waited on".to_string(),
                ));
            }
            *state = ClientState::Connecting;
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            *self.shutdown_tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(shutdown_tx);
            shutdown_rx
        };

        let connected = match self.connect_hosts(pool.as_ref()).await {
            Ok(0) => Err(VipnodeError::NoHostsAvailable(format!(
                "no {} hosts accepted us",
                self.node.kind()
            ))),
            Ok(n) if *shutdown_rx.borrow() => {
                debug!(hosts = n, "Stopped while connecting");
                Err(VipnodeError::InvalidState(
                    "client session stopped while connecting".to_string(),
                ))
            }
            Ok(n) => Ok(n),
            Err(e) => Err(e),
        };
        let n = match connected {
            Ok(n) => n,
            Err(e) => {
                self.disconnect_all().await;
                self.shutdown_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
                self.set_state(ClientState::Stopped);
                return Err(e);
            }
        };
        info!(hosts = n, "Connected to hosts");

        let task = tokio::spawn(self.clone().keepalive(pool, shutdown_rx));
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        self.set_state(ClientState::Connected);
        Ok(())
    }

    /// Signal the loop to disconnect every host and exit. Safe to call when
    /// already stopped.
    pub fn stop(&self) {
        if let Some(tx) = self.shutdown_tx.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = tx.send(true);
        }
    }

    /// Wait for the loop to exit and return its result.
    pub async fn wait(&self) -> VipnodeResult<()> {
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        match task {
            Some(task) => {
                let result = task
                    .await
                    .map_err(|e| VipnodeError::InvalidState(format!("keepalive task failed: {e}")));
                self.set_state(ClientState::Stopped);
                result?
            }
            None => Ok(()),
        }
    }

    /// Connect to newly offered hosts until `num_hosts` are peered.
    /// Returns how many were added.
    async fn connect_hosts(&self, pool: &dyn PoolService) -> VipnodeResult<usize> {
        let offered = pool.connect(self.node.kind()).await?;
        let mut added = 0;
        let mut last_err = None;
        for host in offered {
            if self.num_peers() >= self.num_hosts {
                break;
            }
            let known = self
                .peers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .any(|p| p.node_id == host.node_id);
            if known {
                continue;
            }
            match self.node.connect_peer(&host.uri).await {
                Ok(()) => {
                    debug!(node_id = %host.node_id, uri = %host.uri, "Connected to host");
                    self.peers.lock().unwrap_or_else(|e| e.into_inner()).push(host);
                    added += 1;
                }
                Err(e) => {
                    warn!(node_id = %host.node_id, error = %e, "Failed to connect to host");
                    last_err = Some(e);
                }
            }
        }
        match (added, last_err) {
            (0, Some(e)) => Err(e),
            _ => Ok(added),
        }
    }

    async fn keepalive(
        self: Arc<Self>,
        pool: Arc<dyn PoolService>,
        mut shutdown: watch::Receiver<bool>,
    ) -> VipnodeResult<()> {
        let period = self.keepalive_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.update_once(pool.as_ref()).await {
                        warn!(error = %e, "Client keepalive failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.disconnect_all().await;
        debug!("Client keepalive stopped");
        Ok(())
    }

    async fn update_once(&self, pool: &dyn PoolService) -> VipnodeResult<()> {
        let peers = self.node.peers().await?;
        let resp = pool.update(&peers).await?;
        if resp.invalid_peers.is_empty() {
            return Ok(());
        }

        let dropped: Vec<HostNode> = {
            let mut current = self.peers.lock().unwrap_or_else(|e| e.into_inner());
            let (dropped, kept): (Vec<HostNode>, Vec<HostNode>) = current
                .drain(..)
                .partition(|p| resp.invalid_peers.contains(&p.node_id));
            *current = kept;
            dropped
        };
        if dropped.is_empty() {
            return Ok(());
        }
        for host in &dropped {
            match self.node.disconnect_peer(&host.uri).await {
                Ok(()) => info!(node_id = %host.node_id, "Dropped host the pool no longer lists"),
                Err(e) => warn!(node_id = %host.node_id, error = %e, "Failed to disconnect host"),
            }
        }

        let added = self.connect_hosts(pool).await?;
        debug!(added, peers = self.num_peers(), "Topped up hosts");
        Ok(())
    }

    async fn disconnect_all(&self) {
        let peers = std::mem::take(&mut *self.peers.lock().unwrap_or_else(|e| e.into_inner()));
        for host in peers {
            if let Err(e) = self.node.disconnect_peer(&host.uri).await {
                warn!(node_id = %host.node_id, error = %e, "Failed to disconnect host");
            }
        }
    }
}
