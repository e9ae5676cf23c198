//! Error types for process supervision.

use thiserror::Error;

/// Result type alias for supervisor operations.
pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Supervisor error types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SupervisorError {
    #[error("command not found: {binary}")]
    BinaryNotFound { binary: String },

    #[error("failed to spawn '{binary}': {reason}")]
    SpawnFailed { binary: String, reason: String },

    #[error("managed process has not been started")]
    NotStarted,

    #[error("configuration rejected (exit code {code:?}): {output}")]
    ConfigRejected { code: Option<i32>, output: String },

    #[error("failed to wait for '{binary}': {reason}")]
    WaitFailed { binary: String, reason: String },
}

impl SupervisorError {
    /// Create a spawn failure, mapping a missing executable to `BinaryNotFound`.
    pub fn spawn_failed(binary: impl Into<String>, err: &std::io::Error) -> Self {
        let binary = binary.into();
        if err.kind() == std::io::ErrorKind::NotFound {
            Self::BinaryNotFound { binary }
        } else {
            Self::SpawnFailed {
                binary,
                reason: err.to_string(),
            }
        }
    }

    /// Create a wait failure.
    pub fn wait_failed(binary: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::WaitFailed {
            binary: binary.into(),
            reason: reason.into(),
        }
    }
}
