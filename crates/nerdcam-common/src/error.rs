//! Error taxonomy shared by the relay engine and the HTTP layer.
//!
//! Only [`Error::UpstreamUnavailable`] is ever surfaced to HTTP clients as a
//! failure. Stale sessions, startup timeouts below the retry budget, client
//! disconnects and framing errors are all recovered where they occur.

use std::time::Duration;

/// Common error type for nerdcam.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The upstream source cannot be reached or authenticated.
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The capture process is alive but produced no frame within the threshold.
    #[error("Upstream stale: no frame for {0:?}")]
    UpstreamStale(Duration),

    /// A capture attempt produced no first frame within its startup budget.
    #[error("Upstream startup timed out after {0:?}")]
    UpstreamStartupTimeout(Duration),

    /// The HTTP client went away.
    #[error("Client disconnected")]
    ClientDisconnected,

    /// A capture process emitted a malformed frame.
    #[error("Protocol framing error: {0}")]
    ProtocolFraming(String),

    /// An I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input was provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The requested operation conflicts with current state.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new UpstreamUnavailable error.
    pub fn unavailable<S: Into<String>>(msg: S) -> Self {
        Self::UpstreamUnavailable(msg.into())
    }

    /// Create a new ProtocolFraming error.
    pub fn framing<S: Into<String>>(msg: S) -> Self {
        Self::ProtocolFraming(msg.into())
    }

    /// Create a new InvalidInput error.
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a new Conflict error.
    pub fn conflict<S: Into<String>>(msg: S) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a new Internal error.
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error is part of normal operation and must not be
    /// reported as a failure.
    pub fn is_routine(&self) -> bool {
        matches!(
            self,
            Self::UpstreamStale(_) | Self::ClientDisconnected | Self::ProtocolFraming(_)
        )
    }
}

/// Result type alias using the common Error type.
pub type Result<T> = std::result::Result<T, Error>;
