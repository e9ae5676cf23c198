//! Supervision of the managed load-balancer process.
//!
//! The reconcile loop only talks to [`ProcessSupervisor`]:
//!
//! - `ensure_started` - launch the process once, pointing it at the artifact
//! - `reload` - hand the listening sockets to a new instance (`-sf <old pid>`)
//! - `is_running` - liveness of the current instance
//!
//! [`HaproxySupervisor`] drives a real binary; [`RecordingSupervisor`] records
//! the calls so loop behaviour can be checked without spawning anything.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod error;
pub mod haproxy;
pub mod process;
pub mod recording;

use std::path::Path;

use async_trait::async_trait;

pub use error::{Result, SupervisorError};
pub use haproxy::{HaproxySupervisor, SupervisorConfig};
pub use process::{ProcessResult, ProcessSpec};
pub use recording::{RecordingSupervisor, SupervisorCall};

/// Identity of the managed process instance currently serving.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagedProcessHandle {
    /// Absent until the first successful start.
    pub pid: Option<u32>,
}

/// Lifecycle control of the managed process.
#[async_trait]
pub trait ProcessSupervisor: Send {
    /// Start the process if no live instance exists.
    ///
    /// Returns `true` if a new instance was launched.
    async fn ensure_started(&mut self, artifact: &Path) -> Result<bool>;

    /// Gracefully hand over to a new instance reading `artifact`.
    async fn reload(&mut self, artifact: &Path) -> Result<()>;

    /// Whether the current instance is still alive.
    fn is_running(&mut self) -> bool;

    /// Handle of the current instance.
    fn handle(&self) -> ManagedProcessHandle;

    /// Terminate the current instance.
    async fn shutdown(&mut self) -> Result<()>;
}
