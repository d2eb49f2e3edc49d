//! Transport error taxonomy.

use std::time::Duration;
use thiserror::Error;

/// Errors from the wire protocol layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// The stream ended or the transport was closed locally.
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Call timed out after {0:?}")]
    Timeout(Duration),
    /// The peer answered with an error object.
    #[error("Remote error {code}: {message}")]
    Remote { code: i64, message: String },
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },
    #[error("Method already registered: {0}")]
    DuplicateMethod(String),
    #[error("Service does not offer method: {0}")]
    UnknownServiceMethod(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Alias for wire results.
pub type WireResult<T> = Result<T, WireError>;

impl WireError {
    /// Whether this is the clean end-of-stream / closed-transport condition.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed)
    }
}
