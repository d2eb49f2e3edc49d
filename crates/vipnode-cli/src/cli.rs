//! Clap CLI definitions for vipnode.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
Examples:
  vipnode pool --bind 0.0.0.0:8080                 Run a pool
  vipnode host --pool pool.example:8080 \\
               --node-uri enode://x@203.0.113.5:30303  Offer peer slots
  vipnode client --pool pool.example:8080          Peer with pool hosts
  vipnode invite <node-id>                         Issue a host invite token";

/// vipnode: reliable peers for light Ethereum nodes.
#[derive(Parser, Debug)]
#[command(name = "vipnode", version, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file (default: ~/.vipnode/config.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a pool that matches clients to hosts.
    Pool {
        /// Address to listen on.
        #[arg(long)]
        bind: Option<String>,
        /// Store backend: `memory` or `sqlite:<path>`.
        #[arg(long)]
        store: Option<String>,
        /// Whitelist policy: `skip`, `optimistic` or `require`.
        #[arg(long)]
        whitelist_policy: Option<String>,
    },
    /// Offer the local node's peer slots through a pool.
    Host {
        /// Pool address.
        #[arg(long)]
        pool: Option<String>,
        /// Local node IPC socket.
        #[arg(long)]
        ipc: Option<PathBuf>,
        /// Public node URI; only its address is used.
        #[arg(long)]
        node_uri: Option<String>,
        /// Settlement address reported to the pool.
        #[arg(long)]
        payout: Option<String>,
        /// Key file (relative paths resolve under ~/.vipnode).
        #[arg(long)]
        key: Option<PathBuf>,
        /// Invite token for pools with a registration whitelist.
        #[arg(long)]
        invite: Option<String>,
    },
    /// Keep the local node peered with hosts from a pool.
    Client {
        /// Pool address.
        #[arg(long)]
        pool: Option<String>,
        /// Local node IPC socket.
        #[arg(long)]
        ipc: Option<PathBuf>,
        /// Key file (relative paths resolve under ~/.vipnode).
        #[arg(long)]
        key: Option<PathBuf>,
        /// Number of hosts to stay connected to.
        #[arg(long)]
        num_hosts: Option<usize>,
    },
    /// Print the invite token for a host node ID (needs `pool.invite_secret`).
    Invite {
        /// Node ID to issue the token for.
        node_id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pool_flags() {
        let cli = Cli::try_parse_from([
            "vipnode",
            "--config",
            "/tmp/v.toml",
            "pool",
            "--bind",
            "0.0.0.0:9000",
            "--whitelist-policy",
            "skip",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/v.toml")));
        match cli.command {
            Commands::Pool {
                bind,
                store,
                whitelist_policy,
            } => {
                assert_eq!(bind.as_deref(), Some("0.0.0.0:9000"));
                assert_eq!(store, None);
                assert_eq!(whitelist_policy.as_deref(), Some("skip"));
            }
            other => panic!("Expected pool, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_client_and_global_config_after_subcommand() {
        let cli = Cli::try_parse_from(["vipnode", "client", "--num-hosts", "2", "--config", "c.toml"])
            .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("c.toml")));
        assert!(matches!(cli.command, Commands::Client { num_hosts: Some(2), .. }));
    }

    #[test]
    fn test_subcommand_required() {
        assert!(Cli::try_parse_from(["vipnode"]).is_err());
    }
}
