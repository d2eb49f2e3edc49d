//! vipnode CLI: run a pool, or a host or client session against one.

mod cli;
mod cmd;
mod config;
mod keys;

use crate::cli::{Cli, Commands};
use anyhow::Context;
use clap::Parser;
use tracing::error;
use vipnode_types::config::VipnodeConfig;

/// Log to stderr. `RUST_LOG` wins over the configured level.
fn init_tracing_stderr(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| tracing_subscriber::EnvFilter::try_new(default_level))
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    let (config, source) = config::load_config(cli.config.as_deref());
    init_tracing_stderr(&config.log_level);
    source.log();

    if let Err(e) = run(cli.command, config) {
        error!(error = %format!("{e:#}"), "vipnode exited with an error");
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn run(command: Commands, mut config: VipnodeConfig) -> anyhow::Result<()> {
    let rt = tokio::runtime::Runtime::new().context("starting tokio runtime")?;
    match command {
        Commands::Pool {
            bind,
            store,
            whitelist_policy,
        } => {
            if let Some(bind) = bind {
                config.pool.bind_addr = bind;
            }
            if let Some(store) = store {
                config.pool.store = store;
            }
            if let Some(policy) = whitelist_policy {
                config.pool.whitelist_policy = policy.parse()?;
            }
            rt.block_on(cmd::pool::run(config.pool))
        }
        Commands::Host {
            pool,
            ipc,
            node_uri,
            payout,
            key,
            invite,
        } => {
            let host = &mut config.host;
            if let Some(pool) = pool {
                host.pool_addr = pool;
            }
            if let Some(ipc) = ipc {
                host.ipc_path = ipc;
            }
            if let Some(node_uri) = node_uri {
                host.node_uri = node_uri;
            }
            if let Some(payout) = payout {
                host.payout = payout;
            }
            if let Some(key) = key {
                host.key_path = key;
            }
            rt.block_on(cmd::agent::run_host(config.host, invite))
        }
        Commands::Client {
            pool,
            ipc,
            key,
            num_hosts,
        } => {
            let client = &mut config.client;
            if let Some(pool) = pool {
                client.pool_addr = pool;
            }
            if let Some(ipc) = ipc {
                client.ipc_path = ipc;
            }
            if let Some(key) = key {
                client.key_path = key;
            }
            if let Some(num_hosts) = num_hosts {
                client.num_hosts = num_hosts;
            }
            rt.block_on(cmd::agent::run_client(config.client))
        }
        Commands::Invite { node_id } => {
            let secret = config
                .pool
                .invite_secret
                .as_deref()
                .context("pool.invite_secret is not configured")?;
            println!("{}", vipnode_store::invite_token(secret, &node_id));
            Ok(())
        }
    }
}
