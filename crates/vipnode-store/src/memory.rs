//! In-memory reference store.

use crate::clock::{Clock, SystemClock};
use crate::whitelist::Whitelist;
use crate::{active_cutoff, Store};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use vipnode_types::{Node, Stats, VipnodeError, VipnodeResult};

#[derive(Default)]
struct Inner {
    nodes: HashMap<String, Node>,
    nonces: HashMap<String, i64>,
}

/// Store backed by two maps behind one exclusive lock.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    whitelist: Whitelist,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            whitelist: Whitelist::default(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_whitelist(mut self, whitelist: Whitelist) -> Self {
        self.whitelist = whitelist;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Store for MemoryStore {
    fn set_node(&self, node: Node, whitelist_token: &str) -> VipnodeResult<()> {
        if node.is_host && !self.whitelist.admits(&node.id, whitelist_token) {
            return Err(VipnodeError::Unauthorized(format!(
                "node is not whitelisted: {}",
                node.id
            )));
        }
        self.lock().nodes.insert(node.id.clone(), node);
        Ok(())
    }

    fn get_node(&self, id: &str) -> VipnodeResult<Option<Node>> {
        Ok(self.lock().nodes.get(id).cloned())
    }

    fn check_and_save_nonce(&self, id: &str, nonce: i64) -> VipnodeResult<()> {
        let mut inner = self.lock();
        if let Some(&last) = inner.nonces.get(id) {
            if nonce <= last {
                return Err(VipnodeError::InvalidNonce(format!(
                    "nonce {nonce} is not greater than {last}"
                )));
            }
        }
        inner.nonces.insert(id.to_string(), nonce);
        Ok(())
    }

    fn update_node_peers(&self, id: &str, peers: &[String]) -> VipnodeResult<Vec<String>> {
        let now = self.clock.now();
        let cutoff = active_cutoff(now);
        let mut inner = self.lock();
        let node = inner
            .nodes
            .get_mut(id)
            .ok_or_else(|| VipnodeError::UnregisteredNode(id.to_string()))?;
        node.last_seen = now;

        Ok(peers
            .iter()
            .filter(|peer| {
                inner
                    .nodes
                    .get(peer.as_str())
                    .is_some_and(|n| n.last_seen >= cutoff)
            })
            .cloned()
            .collect())
    }

    fn active_hosts(&self, kind: &str, limit: usize) -> VipnodeResult<Vec<Node>> {
        let cutoff = active_cutoff(self.clock.now());
        let inner = self.lock();
        let mut hosts: Vec<Node> = inner
            .nodes
            .values()
            .filter(|n| n.is_host && n.last_seen >= cutoff)
            .filter(|n| kind.is_empty() || n.kind == kind)
            .cloned()
            .collect();
        hosts.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then_with(|| a.id.cmp(&b.id)));
        hosts.truncate(limit);
        Ok(hosts)
    }

    fn stats(&self) -> VipnodeResult<Stats> {
        let cutoff = active_cutoff(self.clock.now());
        let inner = self.lock();
        let mut stats = Stats {
            num_total_nodes: inner.nodes.len(),
            ..Stats::default()
        };
        for node in inner.nodes.values() {
            let active = node.last_seen >= cutoff;
            if node.is_host {
                stats.num_total_hosts += 1;
                if active {
                    stats.num_active_hosts += 1;
                }
            } else if active {
                stats.num_active_clients += 1;
            }
        }
        Ok(stats)
    }
}
