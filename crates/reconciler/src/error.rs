//! Error types for the reconciler crate.

use std::path::PathBuf;

use plb_core::SnapshotError;
use plb_store::StoreError;
use plb_supervisor::SupervisorError;
use thiserror::Error;

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reconciler error types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("coordination store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid cluster state: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("failed to start managed process: {0}")]
    StartFailed(#[source] SupervisorError),

    #[error("failed to reload managed process: {0}")]
    ReloadFailed(#[source] SupervisorError),

    #[error("failed to write '{path}': {reason}")]
    ArtifactWrite { path: PathBuf, reason: String },

    #[error("max consecutive errors ({max}) reached, last error: {last}")]
    MaxErrors { max: u32, last: String },
}

impl Error {
    /// Create an artifact write error.
    pub fn artifact_write(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::ArtifactWrite {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a max errors error.
    pub fn max_errors(max: u32, last: &Self) -> Self {
        Self::MaxErrors {
            max,
            last: last.to_string(),
        }
    }

    /// Errors that end the loop immediately.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::StartFailed(_) | Self::MaxErrors { .. })
    }

    /// Errors confined to writing or activating a configuration. The
    /// previous configuration stays in effect.
    #[must_use]
    pub fn is_apply_error(&self) -> bool {
        matches!(self, Self::ReloadFailed(_) | Self::ArtifactWrite { .. })
    }

    /// The scope subtree disappeared while it was being read. The loop goes
    /// back to waiting for a leader instead of counting a failure.
    #[must_use]
    pub fn is_scope_gone(&self) -> bool {
        matches!(self, Self::Store(e) if !e.is_retryable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let start = Error::StartFailed(SupervisorError::NotStarted);
        assert!(start.is_fatal());
        assert!(!start.is_apply_error());

        let reload = Error::ReloadFailed(SupervisorError::NotStarted);
        assert!(!reload.is_fatal());
        assert!(reload.is_apply_error());

        let store = Error::from(StoreError::connection_lost("gone"));
        assert!(!store.is_fatal());
        assert!(!store.is_apply_error());
        assert!(!store.is_scope_gone());

        let gone = Error::from(StoreError::no_node("/service/demo"));
        assert!(!gone.is_fatal());
        assert!(gone.is_scope_gone());
    }

    #[test]
    fn test_max_errors_keeps_last_cause() {
        let last = Error::from(SnapshotError::MissingMembers {
            path: "/service/demo".to_string(),
        });
        let err = Error::max_errors(3, &last);
        assert!(err.is_fatal());
        assert!(err.to_string().contains("(3)"));
        assert!(err.to_string().contains("no 'members' node"));
    }
}
