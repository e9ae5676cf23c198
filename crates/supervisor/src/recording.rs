//! In-memory supervisor that records every call.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::error::{Result, SupervisorError};
use crate::{ManagedProcessHandle, ProcessSupervisor};

/// A successful supervisor call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorCall {
    Start { artifact: PathBuf },
    Reload { artifact: PathBuf, previous: u32 },
    Shutdown,
}

#[derive(Debug)]
struct State {
    calls: Vec<SupervisorCall>,
    pid: Option<u32>,
    next_pid: u32,
    running: bool,
    fail_starts: bool,
    fail_reloads: bool,
    failed_reloads: usize,
}

/// Supervisor double. Clones share state, so a test can keep one clone for
/// inspection while the loop owns another.
#[derive(Debug, Clone)]
pub struct RecordingSupervisor {
    state: Arc<Mutex<State>>,
}

impl Default for RecordingSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingSupervisor {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                calls: Vec::new(),
                pid: None,
                next_pid: 1000,
                running: false,
                fail_starts: false,
                fail_reloads: false,
                failed_reloads: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make subsequent starts fail with a spawn error.
    pub fn fail_starts(&self, fail: bool) {
        self.lock().fail_starts = fail;
    }

    /// Make subsequent reloads fail with a rejected configuration.
    pub fn fail_reloads(&self, fail: bool) {
        self.lock().fail_reloads = fail;
    }

    /// Simulate the managed process dying.
    pub fn crash(&self) {
        self.lock().running = false;
    }

    pub fn calls(&self) -> Vec<SupervisorCall> {
        self.lock().calls.clone()
    }

    pub fn start_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| matches!(call, SupervisorCall::Start { .. }))
            .count()
    }

    pub fn reload_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| matches!(call, SupervisorCall::Reload { .. }))
            .count()
    }

    /// Reload attempts that were made to fail.
    pub fn failed_reloads(&self) -> usize {
        self.lock().failed_reloads
    }
}

#[async_trait]
impl ProcessSupervisor for RecordingSupervisor {
    async fn ensure_started(&mut self, artifact: &Path) -> Result<bool> {
        let mut state = self.lock();
        if state.running {
            return Ok(false);
        }
        if state.fail_starts {
            return Err(SupervisorError::SpawnFailed {
                binary: "recording".to_string(),
                reason: "start failure requested".to_string(),
            });
        }
        let pid = state.next_pid;
        state.next_pid = pid.saturating_add(1);
        state.pid = Some(pid);
        state.running = true;
        state.calls.push(SupervisorCall::Start {
            artifact: artifact.to_path_buf(),
        });
        Ok(true)
    }

    async fn reload(&mut self, artifact: &Path) -> Result<()> {
        let mut state = self.lock();
        let previous = state.pid.ok_or(SupervisorError::NotStarted)?;
        if state.fail_reloads {
            state.failed_reloads = state.failed_reloads.saturating_add(1);
            return Err(SupervisorError::ConfigRejected {
                code: Some(1),
                output: "reload failure requested".to_string(),
            });
        }
        let pid = state.next_pid;
        state.next_pid = pid.saturating_add(1);
        state.pid = Some(pid);
        state.calls.push(SupervisorCall::Reload {
            artifact: artifact.to_path_buf(),
            previous,
        });
        Ok(())
    }

    fn is_running(&mut self) -> bool {
        self.lock().running
    }

    fn handle(&self) -> ManagedProcessHandle {
        ManagedProcessHandle {
            pid: self.lock().pid,
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        let mut state = self.lock();
        state.running = false;
        state.calls.push(SupervisorCall::Shutdown);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[tokio::test]
    async fn test_start_then_reload() {
        let observer = RecordingSupervisor::new();
        let mut supervisor = observer.clone();
        let artifact = Path::new("/tmp/haproxy.cfg");

        assert!(supervisor.ensure_started(artifact).await.unwrap());
        assert!(!supervisor.ensure_started(artifact).await.unwrap());
        supervisor.reload(artifact).await.unwrap();

        assert_eq!(
            observer.calls(),
            vec![
                SupervisorCall::Start {
                    artifact: artifact.to_path_buf()
                },
                SupervisorCall::Reload {
                    artifact: artifact.to_path_buf(),
                    previous: 1000
                },
            ]
        );
        assert_eq!(observer.handle().pid, Some(1001));
    }

    #[tokio::test]
    async fn test_crash_allows_restart() {
        let mut supervisor = RecordingSupervisor::new();
        let artifact = Path::new("/tmp/haproxy.cfg");
        supervisor.ensure_started(artifact).await.unwrap();
        supervisor.crash();
        assert!(!supervisor.is_running());
        assert!(supervisor.ensure_started(artifact).await.unwrap());
        assert_eq!(supervisor.start_count(), 2);
    }

    #[tokio::test]
    async fn test_requested_failures() {
        let mut supervisor = RecordingSupervisor::new();
        let artifact = Path::new("/tmp/haproxy.cfg");

        assert_eq!(
            supervisor.reload(artifact).await.unwrap_err(),
            SupervisorError::NotStarted
        );

        supervisor.fail_starts(true);
        assert!(supervisor.ensure_started(artifact).await.is_err());
        supervisor.fail_starts(false);
        supervisor.ensure_started(artifact).await.unwrap();

        supervisor.fail_reloads(true);
        assert!(supervisor.reload(artifact).await.is_err());
        assert_eq!(supervisor.failed_reloads(), 1);
        assert_eq!(supervisor.reload_count(), 0);
    }
}
