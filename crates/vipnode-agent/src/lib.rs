//! Host and client sessions.
//!
//! A session drives the pool protocol from one side and turns its outcomes
//! into peer-management calls on the local Ethereum node ([`EthNode`]).

pub mod client;
pub mod ethnode;
pub mod host;

pub use client::{ClientSession, ClientState};
pub use ethnode::{Call, EthNode, FakeNode, NodeKind, RpcNode};
pub use host::{HostSession, HostState};
