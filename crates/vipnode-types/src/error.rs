//! Shared error types for vipnode.
//!
//! Application errors cross the wire as JSON-RPC error objects. Each variant
//! owns a stable code in the `-32000..=-32099` server range so that the
//! receiving side can rebuild the same variant with [`VipnodeError::from_rpc`].

use thiserror::Error;

/// Top-level error type for the pool, store and sessions.
#[derive(Error, Debug)]
pub enum VipnodeError {
    /// The request signature did not verify against the claimed node ID.
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    /// The request nonce was not greater than the last one seen.
    #[error("Invalid nonce: {0}")]
    InvalidNonce(String),

    /// The node kind is not served by this pool.
    #[error("Unknown kind: {0}")]
    UnknownKind(String),

    /// The node is not on the registration whitelist, or a host refused it.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// A registered host has no live channel to reverse-call it over.
    #[error("No remote channel: {0}")]
    NoRemote(String),

    /// The caller never registered with the pool.
    #[error("Unregistered node: {0}")]
    UnregisteredNode(String),

    /// A node URI failed to parse or did not match the caller.
    #[error("Invalid node URI: {0}")]
    InvalidNodeUri(String),

    /// No active host matched the request.
    #[error("No hosts available: {0}")]
    NoHostsAvailable(String),

    /// The external node rejected a peer-management call.
    #[error("Node call failed: {0}")]
    NodeCall(String),

    /// A storage backend error occurred.
    #[error("Store error: {0}")]
    Store(String),

    /// A session is in the wrong state for the requested operation.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The transport failed (closed connection, timeout, codec fault).
    #[error("Transport error: {0}")]
    Transport(String),

    /// The peer answered with an error code this crate does not model.
    #[error("Remote error {code}: {message}")]
    Remote {
        /// JSON-RPC error code.
        code: i64,
        /// Error text as sent by the peer.
        message: String,
    },

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Alias for Result with VipnodeError.
pub type VipnodeResult<T> = Result<T, VipnodeError>;

pub const CODE_INVALID_SIGNATURE: i64 = -32010;
pub const CODE_INVALID_NONCE: i64 = -32011;
pub const CODE_UNKNOWN_KIND: i64 = -32012;
pub const CODE_UNAUTHORIZED: i64 = -32013;
pub const CODE_NO_REMOTE: i64 = -32014;
pub const CODE_UNREGISTERED_NODE: i64 = -32015;
pub const CODE_INVALID_NODE_URI: i64 = -32016;
pub const CODE_NO_HOSTS_AVAILABLE: i64 = -32017;
pub const CODE_NODE_CALL: i64 = -32020;
pub const CODE_STORE: i64 = -32030;
pub const CODE_INVALID_STATE: i64 = -32040;
/// Catch-all for errors that have no dedicated wire code.
pub const CODE_INTERNAL: i64 = -32603;

impl VipnodeError {
    /// JSON-RPC error code used when this error is sent to a peer.
    pub fn code(&self) -> i64 {
        match self {
            Self::InvalidSignature(_) => CODE_INVALID_SIGNATURE,
            Self::InvalidNonce(_) => CODE_INVALID_NONCE,
            Self::UnknownKind(_) => CODE_UNKNOWN_KIND,
            Self::Unauthorized(_) => CODE_UNAUTHORIZED,
            Self::NoRemote(_) => CODE_NO_REMOTE,
            Self::UnregisteredNode(_) => CODE_UNREGISTERED_NODE,
            Self::InvalidNodeUri(_) => CODE_INVALID_NODE_URI,
            Self::NoHostsAvailable(_) => CODE_NO_HOSTS_AVAILABLE,
            Self::NodeCall(_) => CODE_NODE_CALL,
            Self::Store(_) => CODE_STORE,
            Self::InvalidState(_) => CODE_INVALID_STATE,
            Self::Remote { code, .. } => *code,
            Self::Transport(_) | Self::Config(_) | Self::Io(_) => CODE_INTERNAL,
        }
    }

    /// Rebuild an error from a `(code, message)` pair received over the wire.
    ///
    /// `message` is expected to be the `Display` form produced by the peer;
    /// the variant prefix is stripped so the rebuilt error displays the same.
    pub fn from_rpc(code: i64, message: &str) -> Self {
        let detail = |prefix: &str| {
            message
                .strip_prefix(prefix)
                .unwrap_or(message)
                .to_string()
        };
        match code {
            CODE_INVALID_SIGNATURE => Self::InvalidSignature(detail("Invalid signature: ")),
            CODE_INVALID_NONCE => Self::InvalidNonce(detail("Invalid nonce: ")),
            CODE_UNKNOWN_KIND => Self::UnknownKind(detail("Unknown kind: ")),
            CODE_UNAUTHORIZED => Self::Unauthorized(detail("Unauthorized: ")),
            CODE_NO_REMOTE => Self::NoRemote(detail("No remote channel: ")),
            CODE_UNREGISTERED_NODE => Self::UnregisteredNode(detail("Unregistered node: ")),
            CODE_INVALID_NODE_URI => Self::InvalidNodeUri(detail("Invalid node URI: ")),
            CODE_NO_HOSTS_AVAILABLE => Self::NoHostsAvailable(detail("No hosts available: ")),
            CODE_NODE_CALL => Self::NodeCall(detail("Node call failed: ")),
            CODE_STORE => Self::Store(detail("Store error: ")),
            CODE_INVALID_STATE => Self::InvalidState(detail("Invalid state: ")),
            _ => Self::Remote {
                code,
                message: message.to_string(),
            },
        }
    }

    /// Whether the error came from the transport rather than the peer.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}
