//! Error types for coordination-store access.

use thiserror::Error;

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors returned by a coordination store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("node '{path}' does not exist")]
    NoNode { path: String },

    #[error("coordination store unreachable: {reason}")]
    ConnectionLost { reason: String },

    #[error("{operation} on '{path}' failed: {reason}")]
    OperationFailed {
        operation: &'static str,
        path: String,
        reason: String,
    },
}

impl StoreError {
    /// Create a missing-node error.
    pub fn no_node(path: impl Into<String>) -> Self {
        Self::NoNode { path: path.into() }
    }

    /// Create a connectivity error.
    pub fn connection_lost(reason: impl Into<String>) -> Self {
        Self::ConnectionLost {
            reason: reason.into(),
        }
    }

    /// Create a failed-operation error.
    pub fn operation_failed(
        operation: &'static str,
        path: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::OperationFailed {
            operation,
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if retrying after a pause may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectionLost { .. } | Self::OperationFailed { .. })
    }
}
