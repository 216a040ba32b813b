//! Error taxonomy for the client.
//!
//! Every public, async entry point on [`crate::client::ClientFacade`] returns
//! `Result<_, Error>`. Internal plumbing that is not itself part of the
//! public contract may still reach for `anyhow::Context` to wrap a lower-level
//! failure before converting it at the boundary.

use serde_json::Value;

/// A server-reported RPC failure: `{ code, message, data? }`, plus the
/// request that provoked it.
#[derive(Debug, Clone, thiserror::Error)]
#[error("resource error from {method} (code {code}): {message}")]
pub struct ResourceError {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Malformed wire message, a response with no matching pending request,
    /// a malformed event name, or an unsupported nested `change` value.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server responded to a request with an `error` object.
    #[error(transparent)]
    Resource(#[from] ResourceError),

    /// A cache invariant was violated. This is always a bug in the library
    /// or in an assumption the server broke; it is fatal for the affected
    /// resource.
    #[error("cache integrity error for {rid}: {detail}")]
    CacheIntegrity { rid: String, detail: String },

    /// The transport failed to open, errored, or closed while a request or
    /// the connect future was outstanding.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A model type was registered with a malformed id, or an id already in
    /// use.
    #[error("config error: {0}")]
    Config(String),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("failed to open connection: {0}")]
    Open(String),
    #[error("transport error: {0}")]
    Io(String),
    #[error("connection closed")]
    Closed,
}

impl Error {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    pub(crate) fn cache_integrity(rid: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::CacheIntegrity {
            rid: rid.into(),
            detail: detail.into(),
        }
    }
}
