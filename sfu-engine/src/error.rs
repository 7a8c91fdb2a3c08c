//! Error types for the media engine control plane

use thiserror::Error;

/// Engine error types
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed caller input, unknown id or incompatible capabilities.
    /// Raised before any request reaches the worker.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The worker answered the request with an error outcome
    #[error("Request {method} failed: {reason}")]
    Protocol { method: String, reason: String },

    /// Operation attempted on an entity that is already closed
    #[error("{0} closed")]
    Closed(String),

    /// Request issued on a channel that no longer accepts requests
    #[error("Channel closed")]
    ChannelClosed,

    /// Worker process died or its channel was severed
    #[error("Worker failure: {0}")]
    WorkerFailure(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub(crate) fn closed(what: impl Into<String>) -> Self {
        Self::Closed(what.into())
    }

    /// Whether the error means the worker behind the channel is gone
    #[must_use]
    pub const fn is_worker_failure(&self) -> bool {
        matches!(self, Self::WorkerFailure(_))
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;
