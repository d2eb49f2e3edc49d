//! Core types for vipnode.
//!
//! This crate defines the data structures shared by the pool service, the
//! node store, and the host/client sessions. It contains no business logic.

pub mod config;
pub mod error;
pub mod node;
pub mod nodeuri;

pub use error::{VipnodeError, VipnodeResult};
pub use node::{HostNode, Node, Stats, UpdateResponse};
pub use nodeuri::NodeUri;
