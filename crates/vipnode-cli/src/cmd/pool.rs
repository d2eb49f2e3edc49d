//! `vipnode pool`: accept TCP connections and serve the pool on each.

use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use vipnode_pool::{Pool, PoolOptions, METHOD_PREFIX};
use vipnode_store::Whitelist;
use vipnode_types::config::PoolConfig;
use vipnode_wire::{IoCodec, Remote, Server};

pub async fn run(config: PoolConfig) -> anyhow::Result<()> {
    let whitelist = Whitelist::new(
        config.registration_whitelist.iter().cloned(),
        config.invite_secret.clone(),
    );
    if whitelist.is_enforced() {
        info!(
            listed = config.registration_whitelist.len(),
            invites = config.invite_secret.is_some(),
            "Host registration is restricted"
        );
    }
    let store = vipnode_store::open(&config.store_backend()?, whitelist)?;
    let pool = Arc::new(Pool::new(store, PoolOptions::from(&config)));

    // One registry shared by every connection; each Remote supplies its own
    // reverse channel through the call context.
    let server = Arc::new(Server::new());
    server.register(METHOD_PREFIX, pool.clone(), &[])?;

    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!(
        addr = %listener.local_addr()?,
        policy = ?config.whitelist_policy,
        store = %config.store,
        "Pool listening"
    );

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        continue;
                    }
                };
                info!(peer = %peer, "Connection accepted");
                let remote = Remote::with_server(Arc::new(IoCodec::from_tcp(stream)), server.clone());
                tokio::spawn(async move {
                    match remote.serve().await {
                        Err(e) if !e.is_closed() => warn!(peer = %peer, error = %e, "Connection failed"),
                        _ => info!(peer = %peer, "Connection closed"),
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                let stats = pool.store().stats()?;
                info!(
                    active_hosts = stats.num_active_hosts,
                    active_clients = stats.num_active_clients,
                    "Shutting down pool"
                );
                return Ok(());
            }
        }
    }
}
