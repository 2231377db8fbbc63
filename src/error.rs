//! Error types for the topology and state transfer core.

use crate::types::{Address, TopologyId};
use thiserror::Error;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Network communication errors.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Local store errors.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Topology construction or ordering errors.
    #[error("topology error: {0}")]
    Topology(#[from] TopologyError),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// No component registered for the named cache.
    #[error("cache not found: {0}")]
    CacheNotFound(String),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Errors from sending commands between nodes.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Target node is not reachable.
    #[error("node unreachable: {0}")]
    Unreachable(Address),

    /// Target node left the cluster while the request was outstanding.
    #[error("node left: {0}")]
    NodeLeft(Address),

    /// Serialization error.
    #[error("encode error: {0}")]
    Encode(String),

    /// Deserialization error.
    #[error("decode error: {0}")]
    Decode(String),

    /// Unexpected response to a request.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

/// Local data store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Write could not be made visible.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// Read failed.
    #[error("read failed: {0}")]
    ReadFailed(String),
}

/// Topology errors.
#[derive(Error, Debug)]
pub enum TopologyError {
    /// A consistent hash violated one of its invariants.
    #[error("invalid consistent hash: {0}")]
    InvalidConsistentHash(String),

    /// A cache topology violated one of its invariants.
    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    /// An update carried an id not newer than the installed one.
    #[error("stale topology {received}, current is {current}")]
    Stale {
        received: TopologyId,
        current: TopologyId,
    },

    /// No topology installed yet.
    #[error("no topology installed")]
    NotInstalled,
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Transport(TransportError::Encode(e.to_string()))
    }
}

impl Error {
    /// Whether the failure is caused by topology churn and can be retried
    /// under the next topology.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Topology(TopologyError::Stale { .. })
                | Error::Transport(TransportError::NodeLeft(_))
                | Error::Transport(TransportError::Unreachable(_))
                | Error::Timeout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err: Error = TopologyError::Stale {
            received: 3,
            current: 5,
        }
        .into();
        assert_eq!(err.to_string(), "topology error: stale topology 3, current is 5");
        assert!(err.is_retryable());
        assert!(!Error::Cancelled.is_retryable());
    }
}
