//! The vipnode pool: registers hosts, matches clients to them and tracks
//! liveness through keepalive updates.
//!
//! - [`Pool`] is the service, exposed over a [`vipnode_wire::Server`]
//! - [`RemotePool`] is the typed, signing client used by host and client sessions
//! - [`PoolService`] is the seam between the two

pub mod api;
pub mod pool;
pub mod remote;
pub mod request;

pub use api::{PoolService, METHOD_PREFIX, WHITELIST_METHOD};
pub use pool::{rpc_error, Pool, PoolOptions};
pub use remote::RemotePool;
pub use request::{Signer, SignedRequest};
