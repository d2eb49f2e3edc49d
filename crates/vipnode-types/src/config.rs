//! Configuration types for the pool, host and client.
//!
//! Every section carries `#[serde(default)]` so a partial `config.toml`
//! only overrides the fields it names.

use crate::error::{VipnodeError, VipnodeResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default interval between keepalive `update` calls.
pub const DEFAULT_KEEPALIVE_INTERVAL_SECS: u64 = 60;

/// Root configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VipnodeConfig {
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
    pub pool: PoolConfig,
    pub host: HostConfig,
    pub client: ClientConfig,
}

impl Default for VipnodeConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            pool: PoolConfig::default(),
            host: HostConfig::default(),
            client: ClientConfig::default(),
        }
    }
}

/// How the pool gates `connect` results on the host's whitelist answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WhitelistPolicy {
    /// Never reverse-call hosts; every candidate is returned.
    Skip,
    /// Fire the reverse calls in the background and return every candidate
    /// that has a live channel.
    Optimistic,
    /// Wait for each host to acknowledge; only acknowledged hosts are returned.
    #[default]
    Require,
}

impl std::str::FromStr for WhitelistPolicy {
    type Err = VipnodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "skip" => Ok(Self::Skip),
            "optimistic" => Ok(Self::Optimistic),
            "require" => Ok(Self::Require),
            other => Err(VipnodeError::Config(format!(
                "unknown whitelist policy: {other}"
            ))),
        }
    }
}

/// Storage backend selected by [`PoolConfig::store`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Sqlite(PathBuf),
}

/// Pool service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// TCP address the pool listens on.
    pub bind_addr: String,
    /// `memory` or `sqlite:<path>`.
    pub store: String,
    pub whitelist_policy: WhitelistPolicy,
    /// Upper bound on each reverse `whitelist` call.
    pub whitelist_timeout_secs: u64,
    /// Maximum number of hosts returned by one `connect`.
    pub max_hosts_per_connect: usize,
    /// Node kinds this pool matches.
    pub kinds: Vec<String>,
    /// Node IDs allowed to register as hosts. Empty means open registration.
    pub registration_whitelist: Vec<String>,
    /// Secret for HMAC invite tokens accepted in place of a listed ID.
    pub invite_secret: Option<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            store: "memory".to_string(),
            whitelist_policy: WhitelistPolicy::Require,
            whitelist_timeout_secs: 10,
            max_hosts_per_connect: 3,
            kinds: vec!["geth".to_string(), "parity".to_string()],
            registration_whitelist: Vec::new(),
            invite_secret: None,
        }
    }
}

impl PoolConfig {
    pub fn whitelist_timeout(&self) -> Duration {
        Duration::from_secs(self.whitelist_timeout_secs)
    }

    /// Parse the `store` field.
    pub fn store_backend(&self) -> VipnodeResult<StoreBackend> {
        match self.store.as_str() {
            "memory" | "" => Ok(StoreBackend::Memory),
            other => match other.strip_prefix("sqlite:") {
                Some(path) if !path.is_empty() => Ok(StoreBackend::Sqlite(PathBuf::from(path))),
                _ => Err(VipnodeError::Config(format!("unknown store backend: {other}"))),
            },
        }
    }

    /// Whether registration is gated at all.
    pub fn whitelist_enforced(&self) -> bool {
        !self.registration_whitelist.is_empty() || self.invite_secret.is_some()
    }
}

/// Host session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub pool_addr: String,
    /// Public `enode://` URI advertised to the pool. Empty asks the node.
    pub node_uri: String,
    /// Settlement address reported to the pool.
    pub payout: String,
    /// Path of the local node's IPC socket.
    pub ipc_path: PathBuf,
    /// The node's secp256k1 `nodekey` file; pool requests are signed with it.
    pub key_path: PathBuf,
    pub keepalive_interval_secs: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            pool_addr: "127.0.0.1:8080".to_string(),
            node_uri: String::new(),
            payout: String::new(),
            ipc_path: default_ipc_path(),
            key_path: default_key_path("host.key"),
            keepalive_interval_secs: DEFAULT_KEEPALIVE_INTERVAL_SECS,
        }
    }
}

impl HostConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }
}

/// Client session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub pool_addr: String,
    pub ipc_path: PathBuf,
    pub key_path: PathBuf,
    /// How many hosts the client tries to stay connected to.
    pub num_hosts: usize,
    pub keepalive_interval_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            pool_addr: "127.0.0.1:8080".to_string(),
            ipc_path: default_ipc_path(),
            key_path: default_key_path("client.key"),
            num_hosts: 3,
            keepalive_interval_secs: DEFAULT_KEEPALIVE_INTERVAL_SECS,
        }
    }
}

impl ClientConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }
}

fn default_ipc_path() -> PathBuf {
    PathBuf::from("geth.ipc")
}

fn default_key_path(name: &str) -> PathBuf {
    PathBuf::from(name)
}
