//! `vipnode host` and `vipnode client`: run a session against a remote pool
//! until Ctrl-C.
//!
//! Losing the pool is not fatal. A failed dial, a refused registration or a
//! dropped connection is logged and retried every keepalive interval.

use crate::config::resolve_home;
use crate::keys;
use anyhow::{bail, Context};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use vipnode_agent::{ClientSession, HostSession, RpcNode};
use vipnode_pool::{RemotePool, Signer, WHITELIST_METHOD};
use vipnode_types::config::{ClientConfig, HostConfig};
use vipnode_types::NodeUri;
use vipnode_wire::{IoCodec, Remote, WireResult};

/// How one pool session ended.
#[derive(Debug, PartialEq, Eq)]
enum Exit {
    Interrupted,
    Disconnected,
}

/// Dial the pool, giving up early on Ctrl-C.
async fn dial_pool(addr: &str) -> anyhow::Result<Option<Arc<Remote>>> {
    let stream = tokio::select! {
        _ = tokio::signal::ctrl_c() => return Ok(None),
        stream = TcpStream::connect(addr) => {
            stream.with_context(|| format!("connecting to pool at {addr}"))?
        }
    };
    info!(pool = %addr, "Connected to pool");
    Ok(Some(Arc::new(Remote::new(Arc::new(IoCodec::from_tcp(stream))))))
}

fn spawn_serve(remote: &Arc<Remote>) -> JoinHandle<WireResult<()>> {
    let remote = remote.clone();
    tokio::spawn(async move { remote.serve().await })
}

/// Block until Ctrl-C or until the pool connection drops.
async fn run_until_interrupted(serving: &mut JoinHandle<WireResult<()>>) -> Exit {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, stopping");
            Exit::Interrupted
        }
        result = serving => {
            match result {
                Ok(Err(e)) if !e.is_closed() => warn!(error = %e, "Pool connection failed"),
                _ => warn!("Pool connection closed"),
            }
            Exit::Disconnected
        }
    }
}

/// Sleep before the next attempt. Returns `true` if interrupted instead.
async fn backoff(retry: Duration) -> bool {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => true,
        _ = tokio::time::sleep(retry) => false,
    }
}

/// The pool identity must be the node's own enode ID, otherwise the IDs the
/// pool hands out are not ones the node can peer with.
fn check_identity(signer: &Signer, node_uri: &NodeUri) -> anyhow::Result<()> {
    if node_uri.id() != signer.node_id() {
        bail!(
            "node ID {} does not match key {}; point key_path at the node's nodekey file",
            node_uri.id(),
            signer.node_id()
        );
    }
    Ok(())
}

/// The URI advertised to the pool: the node's enode ID plus its address, if
/// dialable. Without an address the pool fills in the connection's IP.
fn advertised_uri(signer: &Signer, node_uri: &NodeUri) -> anyhow::Result<String> {
    check_identity(signer, node_uri)?;
    let addr = node_uri.remote_address();
    if addr.is_empty() {
        Ok(format!("enode://{}", node_uri.id()))
    } else {
        Ok(format!("enode://{}@{addr}", node_uri.id()))
    }
}

async fn connect_node(path: &std::path::Path) -> anyhow::Result<Arc<RpcNode>> {
    let node = RpcNode::connect_ipc(path)
        .await
        .with_context(|| format!("connecting to node at {}", path.display()))?;
    Ok(Arc::new(node))
}

pub async fn run_host(config: HostConfig, invite: Option<String>) -> anyhow::Result<()> {
    let signer = keys::load_or_create(&resolve_home(&config.key_path))?;
    let node = connect_node(&config.ipc_path).await?;
    let node_uri = if config.node_uri.is_empty() {
        node.enode().await?
    } else {
        NodeUri::parse(&config.node_uri)?
    };
    let node_uri = advertised_uri(&signer, &node_uri)?;

    let session = Arc::new(
        HostSession::new(node, node_uri.clone(), config.payout.clone())
            .with_keepalive_interval(config.keepalive_interval()),
    );
    let retry = config.keepalive_interval();
    loop {
        match host_once(&config.pool_addr, &session, &signer, invite.as_deref()).await {
            Ok(Exit::Interrupted) => return Ok(()),
            Ok(Exit::Disconnected) => {}
            Err(e) => warn!(error = %format!("{e:#}"), "Hosting failed"),
        }
        info!(retry_secs = retry.as_secs(), "Reconnecting to pool");
        if backoff(retry).await {
            return Ok(());
        }
    }
}

async fn host_once(
    pool_addr: &str,
    session: &Arc<HostSession>,
    signer: &Signer,
    invite: Option<&str>,
) -> anyhow::Result<Exit> {
    let Some(remote) = dial_pool(pool_addr).await? else {
        return Ok(Exit::Interrupted);
    };
    remote
        .server()
        .register_method(WHITELIST_METHOD, session.clone(), "whitelist")?;
    let mut serving = spawn_serve(&remote);

    let mut pool = RemotePool::new(remote.client().clone(), signer.clone());
    if let Some(token) = invite {
        pool = pool.with_invite(token);
    }
    if let Err(e) = session.start(Arc::new(pool)).await {
        let _ = remote.close().await;
        return Err(e.into());
    }
    info!("Hosting");

    let exit = run_until_interrupted(&mut serving).await;
    session.stop();
    session.wait().await?;
    let _ = remote.close().await;
    Ok(exit)
}

pub async fn run_client(config: ClientConfig) -> anyhow::Result<()> {
    let signer = keys::load_or_create(&resolve_home(&config.key_path))?;
    let node = connect_node(&config.ipc_path).await?;
    check_identity(&signer, &node.enode().await?)?;

    let session = Arc::new(
        ClientSession::new(node)
            .with_num_hosts(config.num_hosts)
            .with_keepalive_interval(config.keepalive_interval()),
    );
    let retry = config.keepalive_interval();
    loop {
        match client_once(&config.pool_addr, &session, &signer).await {
            Ok(Exit::Interrupted) => return Ok(()),
            Ok(Exit::Disconnected) => {}
            Err(e) => warn!(error = %format!("{e:#}"), "Client session failed"),
        }
        info!(retry_secs = retry.as_secs(), "Reconnecting to pool");
        if backoff(retry).await {
            return Ok(());
        }
    }
}

async fn client_once(
    pool_addr: &str,
    session: &Arc<ClientSession>,
    signer: &Signer,
) -> anyhow::Result<Exit> {
    let Some(remote) = dial_pool(pool_addr).await? else {
        return Ok(Exit::Interrupted);
    };
    let mut serving = spawn_serve(&remote);

    let pool = RemotePool::new(remote.client().clone(), signer.clone());
    if let Err(e) = session.start(Arc::new(pool)).await {
        let _ = remote.close().await;
        return Err(e.into());
    }
    info!(hosts = session.peers().len(), "Client connected");

    let exit = run_until_interrupted(&mut serving).await;
    session.stop();
    session.wait().await?;
    let _ = remote.close().await;
    Ok(exit)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> Signer {
        Signer::from_hex(&format!("{}01", "00".repeat(31))).unwrap()
    }

    #[test]
    fn test_advertised_uri_keeps_node_identity() {
        let signer = signer();
        let id = signer.node_id().to_string();
        assert_eq!(id.len(), 128);

        let uri = NodeUri::parse(&format!("enode://{id}@203.0.113.5:30303")).unwrap();
        assert_eq!(
            advertised_uri(&signer, &uri).unwrap(),
            format!("enode://{id}@203.0.113.5:30303")
        );
        let local = NodeUri::parse(&format!("enode://{id}@127.0.0.1:30303")).unwrap();
        assert_eq!(advertised_uri(&signer, &local).unwrap(), format!("enode://{id}"));
        let bare = NodeUri::parse(&id).unwrap();
        assert_eq!(advertised_uri(&signer, &bare).unwrap(), format!("enode://{id}"));
    }

    #[test]
    fn test_foreign_node_id_is_rejected() {
        let other = format!("enode://{}@203.0.113.5:30303", "ab".repeat(64));
        let err = advertised_uri(&signer(), &NodeUri::parse(&other).unwrap()).unwrap_err();
        assert!(err.to_string().contains("nodekey"));
        assert!(check_identity(&Signer::generate(), &NodeUri::parse(&other).unwrap()).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_pool_is_an_error_not_a_panic() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let session = Arc::new(ClientSession::new(Arc::new(vipnode_agent::FakeNode::new("me"))));
        assert!(client_once(&addr, &session, &signer()).await.is_err());
    }
}
