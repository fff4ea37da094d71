//! Error types for nerdcam-av.

use std::time::Duration;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while managing external processes.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The executable does not exist.
    #[error("tool not found: {tool}")]
    ToolNotFound { tool: String },

    /// The executable exists but may not be run.
    #[error("permission denied starting {tool}")]
    PermissionDenied { tool: String },

    /// Spawning failed for another reason.
    #[error("failed to spawn {tool}: {message}")]
    SpawnFailed { tool: String, message: String },

    /// The process did not exit within the wait timeout.
    #[error("{tool} did not exit within {timeout:?}")]
    WaitTimeout { tool: String, timeout: Duration },

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a tool not found error.
    pub fn tool_not_found(tool: impl Into<String>) -> Self {
        Self::ToolNotFound { tool: tool.into() }
    }

    /// Classify an error returned by `spawn`.
    pub fn from_spawn(tool: impl Into<String>, err: std::io::Error) -> Self {
        let tool = tool.into();
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::ToolNotFound { tool },
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { tool },
            _ => Self::SpawnFailed {
                tool,
                message: err.to_string(),
            },
        }
    }

    /// Whether the failure happened before the process existed.
    pub fn is_start_failure(&self) -> bool {
        matches!(
            self,
            Self::ToolNotFound { .. } | Self::PermissionDenied { .. } | Self::SpawnFailed { .. }
        )
    }
}

impl From<Error> for nerdcam_common::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => nerdcam_common::Error::Io(e),
            other => nerdcam_common::Error::internal(other.to_string()),
        }
    }
}
