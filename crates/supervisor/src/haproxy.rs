//! Supervisor for a real HAProxy binary.
//!
//! Start: `haproxy -f <artifact> [-p <pid file>]`.
//! Reload: `haproxy -f <artifact> [-p <pid file>] -sf <old pid>`, which makes
//! the new instance take over the listeners and tells the old one to finish
//! its connections and exit. The new child becomes current; the old child is
//! reaped in the background.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use plb_core::LbConfig;
use tokio::process::Child;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{Result, SupervisorError};
use crate::process::ProcessSpec;
use crate::{ManagedProcessHandle, ProcessSupervisor};

/// How to invoke HAProxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub process: ProcessSpec,
    /// Passed as `-p` on every launch.
    pub pid_file: Option<PathBuf>,
    /// Validate with `-c` before each reload.
    pub check_config: bool,
}

impl SupervisorConfig {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            process: ProcessSpec::new(binary),
            pid_file: None,
            check_config: false,
        }
    }

    /// Arguments placed before the HAProxy flags.
    #[must_use]
    pub fn base_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.process = self.process.args(args);
        self
    }

    #[must_use]
    pub fn pid_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.pid_file = Some(path.into());
        self
    }

    #[must_use]
    pub const fn check_config(mut self, check: bool) -> Self {
        self.check_config = check;
        self
    }
}

impl From<&LbConfig> for SupervisorConfig {
    fn from(config: &LbConfig) -> Self {
        let supervisor = Self::new(config.haproxy_bin.clone()).check_config(config.check_config);
        match &config.pid_file {
            Some(path) => supervisor.pid_file(path.clone()),
            None => supervisor,
        }
    }
}

/// Owns the serving HAProxy instance.
pub struct HaproxySupervisor {
    config: SupervisorConfig,
    current: Option<Child>,
    handle: ManagedProcessHandle,
    draining: JoinSet<()>,
}

impl HaproxySupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            current: None,
            handle: ManagedProcessHandle::default(),
            draining: JoinSet::new(),
        }
    }

    fn launch_args(&self, artifact: &Path) -> Vec<OsString> {
        let mut args = vec!["-f".into(), artifact.as_os_str().to_owned()];
        if let Some(pid_file) = &self.config.pid_file {
            args.push("-p".into());
            args.push(pid_file.as_os_str().to_owned());
        }
        args
    }

    fn reap_finished_drains(&mut self) {
        while self.draining.try_join_next().is_some() {}
    }
}

async fn validate(process: &ProcessSpec, artifact: &Path) -> Result<()> {
    let result = process
        .run([OsStr::new("-c"), OsStr::new("-f"), artifact.as_os_str()])
        .await?;
    if result.is_success() {
        debug!(artifact = %artifact.display(), "Configuration check passed");
        Ok(())
    } else {
        Err(SupervisorError::ConfigRejected {
            code: result.exit_code,
            output: result.output(),
        })
    }
}

async fn drain(mut old: Child) {
    let pid = old.id();
    match old.wait().await {
        Ok(status) => debug!(?pid, %status, "Previous HAProxy instance exited"),
        Err(e) => warn!(?pid, error = %e, "Failed to wait for previous HAProxy instance"),
    }
}

#[async_trait]
impl ProcessSupervisor for HaproxySupervisor {
    async fn ensure_started(&mut self, artifact: &Path) -> Result<bool> {
        if self.is_running() {
            return Ok(false);
        }
        if let Some(pid) = self.handle.pid {
            warn!(pid, "HAProxy is no longer running, starting a new instance");
        }

        let child = self.config.process.spawn(self.launch_args(artifact))?;
        self.handle.pid = child.id();
        self.current = Some(child);
        info!(pid = ?self.handle.pid, artifact = %artifact.display(), "HAProxy started");
        Ok(true)
    }

    async fn reload(&mut self, artifact: &Path) -> Result<()> {
        let old_pid = self.handle.pid.ok_or(SupervisorError::NotStarted)?;
        if self.config.check_config {
            validate(&self.config.process, artifact).await?;
        }

        let mut args = self.launch_args(artifact);
        args.push("-sf".into());
        args.push(old_pid.to_string().into());
        let child = self.config.process.spawn(args)?;
        let new_pid = child.id();

        self.reap_finished_drains();
        if let Some(old) = self.current.replace(child) {
            self.draining.spawn(drain(old));
        }
        self.handle.pid = new_pid;
        info!(old_pid, new_pid = ?new_pid, "HAProxy reloaded");
        Ok(())
    }

    fn is_running(&mut self) -> bool {
        match self.current.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn handle(&self) -> ManagedProcessHandle {
        self.handle
    }

    async fn shutdown(&mut self) -> Result<()> {
        if let Some(mut child) = self.current.take() {
            let pid = child.id();
            // Already-exited children make kill report an error; only a failed wait matters.
            let _ = child.start_kill();
            child.wait().await.map_err(|e| {
                SupervisorError::wait_failed(&self.config.process.command, e.to_string())
            })?;
            info!(?pid, "HAProxy stopped");
        }
        self.draining.shutdown().await;
        Ok(())
    }
}
