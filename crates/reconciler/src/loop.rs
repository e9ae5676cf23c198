//! Continuous reconciliation loop.
//!
//! ```text
//! AwaitingLeader -> Reconciling -> Idle -> Reconciling -> ...
//!                        |
//!                        +-> BackingOff -> Reconciling
//! ```
//!
//! Every cycle mirrors the scope tree with fresh watches, builds a snapshot,
//! renders it and applies the text only if it differs from the last applied
//! one. The previous cycle's watches are retired after the new ones are armed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use plb_core::{build_snapshot, join_path, render, LbConfig, RenderSettings, RenderedConfig};
use plb_store::{CoordinationStore, TreeWatcher, WatchedTree};
use plb_supervisor::ProcessSupervisor;
use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::artifact::write_artifact;
use crate::error::{Error, Result};

/// Configuration for the reconcile loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopConfig {
    /// Root of the mirrored subtree.
    pub scope_path: String,
    /// Node that must exist before anything is served.
    pub leader_path: String,
    /// Where the rendered configuration is written.
    pub artifact_path: PathBuf,
    /// Upper bound on a single wait for the leader watch.
    pub leader_recheck_interval: Duration,
    /// First delay after a failed cycle; doubles up to `max_backoff`.
    pub retry_backoff: Duration,
    pub max_backoff: Duration,
    /// Maximum consecutive failed cycles before stopping.
    pub max_errors: u32,
    /// Whether to stop on the first failed cycle.
    pub stop_on_error: bool,
    /// Managed-process liveness check period while idle. Zero disables.
    pub liveness_interval: Duration,
    pub render: RenderSettings,
}

impl LoopConfig {
    pub fn new(scope_path: impl Into<String>, artifact_path: impl Into<PathBuf>) -> Self {
        let scope_path = scope_path.into();
        Self {
            leader_path: join_path(&scope_path, "leader"),
            scope_path,
            artifact_path: artifact_path.into(),
            leader_recheck_interval: Duration::from_secs(30),
            retry_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            max_errors: 10,
            stop_on_error: false,
            liveness_interval: Duration::from_secs(5),
            render: RenderSettings::default(),
        }
    }
}

impl From<&LbConfig> for LoopConfig {
    fn from(config: &LbConfig) -> Self {
        Self {
            scope_path: config.scope_path(),
            leader_path: config.leader_path(),
            artifact_path: config.config_path.clone(),
            leader_recheck_interval: config.leader_recheck_interval,
            retry_backoff: config.retry_backoff,
            max_backoff: config.max_retry_backoff,
            max_errors: config.max_consecutive_errors,
            stop_on_error: false,
            liveness_interval: config.liveness_interval,
            render: config.render.clone(),
        }
    }
}

/// Observable state of the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    AwaitingLeader,
    Reconciling,
    Idle,
    BackingOff,
    Stopped,
}

/// What a successful cycle did with the rendered configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Written and activated.
    Applied,
    /// Byte-identical to the last applied configuration.
    Unchanged,
    /// Writing or reloading failed; the previous configuration stays in effect.
    ApplyFailed,
}

enum Wake {
    Changed,
    ProcessExited,
    Stopped,
}

struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
    failures: u32,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial,
            failures: 0,
        }
    }

    fn reset(&mut self) {
        self.next = self.initial;
        self.failures = 0;
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);
        delay
    }
}

/// Drives the managed process from the state of one Patroni scope.
pub struct ReconcileLoop {
    store: Arc<dyn CoordinationStore>,
    watcher: TreeWatcher,
    supervisor: Box<dyn ProcessSupervisor>,
    config: LoopConfig,
    /// Last configuration that was written and activated.
    last_applied: Option<RenderedConfig>,
    phase_tx: watch::Sender<LoopPhase>,
    stop_rx: watch::Receiver<bool>,
    stop_tx: watch::Sender<bool>,
}

impl ReconcileLoop {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        supervisor: Box<dyn ProcessSupervisor>,
        config: LoopConfig,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (phase_tx, _) = watch::channel(LoopPhase::AwaitingLeader);
        Self {
            watcher: TreeWatcher::new(Arc::clone(&store)),
            store,
            supervisor,
            config,
            last_applied: None,
            phase_tx,
            stop_rx,
            stop_tx,
        }
    }

    /// The watcher building this loop's mirrors.
    pub fn watcher(&self) -> &TreeWatcher {
        &self.watcher
    }

    /// Last configuration that was successfully applied.
    pub fn last_applied(&self) -> Option<&RenderedConfig> {
        self.last_applied.as_ref()
    }

    /// Follow phase transitions.
    pub fn phase_watcher(&self) -> watch::Receiver<LoopPhase> {
        self.phase_tx.subscribe()
    }

    fn set_phase(&self, phase: LoopPhase) {
        let previous = self.phase_tx.send_replace(phase);
        if previous != phase {
            debug!(from = ?previous, to = ?phase, "Loop phase changed");
        }
    }

    /// Run until stopped or a fatal error occurs.
    ///
    /// Watches are retired and the managed process is shut down on the way out.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            scope = %self.config.scope_path,
            artifact = %self.config.artifact_path.display(),
            "Starting reconcile loop"
        );

        let mut current: Option<WatchedTree> = None;
        let result = self.drive(&mut current).await;

        if let Some(tree) = current.take() {
            tree.retire().await;
        }
        if let Err(e) = self.supervisor.shutdown().await {
            warn!(error = %e, "Failed to stop managed process");
        }
        self.set_phase(LoopPhase::Stopped);

        match &result {
            Ok(()) => info!("Reconcile loop stopped"),
            Err(e) => error!(error = %e, "Reconcile loop failed"),
        }
        result
    }

    async fn drive(&mut self, current: &mut Option<WatchedTree>) -> Result<()> {
        let mut backoff = Backoff::new(self.config.retry_backoff, self.config.max_backoff);
        let mut leader_seen = false;

        loop {
            if !leader_seen {
                self.set_phase(LoopPhase::AwaitingLeader);
                match self.await_leader().await {
                    Ok(true) => leader_seen = true,
                    Ok(false) => return Ok(()),
                    Err(e) => {
                        if self.back_off(e, &mut backoff).await? {
                            continue;
                        }
                        return Ok(());
                    }
                }
            }

            self.set_phase(LoopPhase::Reconciling);
            match self.reconcile_once().await {
                Ok((tree, outcome)) => {
                    backoff.reset();
                    debug!(?outcome, waiters = tree.waiter_count(), "Cycle finished");
                    if let Some(previous) = current.replace(tree) {
                        previous.retire().await;
                    }
                }
                Err(e) if e.is_scope_gone() => {
                    info!(error = %e, "Scope vanished, waiting for a leader again");
                    leader_seen = false;
                    continue;
                }
                Err(e) => {
                    if self.back_off(e, &mut backoff).await? {
                        continue;
                    }
                    return Ok(());
                }
            }

            let Some(tree) = current.as_mut() else { continue };
            self.set_phase(LoopPhase::Idle);
            match self.idle(tree).await {
                Wake::Changed | Wake::ProcessExited => {}
                Wake::Stopped => return Ok(()),
            }
        }
    }

    /// Wait until the leader node exists.
    ///
    /// Returns `false` if the loop was stopped first.
    pub async fn await_leader(&mut self) -> Result<bool> {
        let mut stop_rx = self.stop_rx.clone();
        loop {
            let (exists, leader_watch) = self
                .store
                .exists_and_watch(&self.config.leader_path)
                .await?;
            if exists {
                info!(leader = %self.config.leader_path, "Leader is present");
                return Ok(true);
            }

            info!(leader = %self.config.leader_path, "Waiting for a leader");
            tokio::select! {
                event = leader_watch => debug!(?event, "Leader watch fired"),
                () = tokio::time::sleep(self.config.leader_recheck_interval) => {
                    debug!("Rechecking leader");
                }
                () = stop_requested(&mut stop_rx) => return Ok(false),
            }
        }
    }

    /// Run a single reconciliation cycle.
    ///
    /// Returns the freshly armed mirror; the caller owns its watches.
    pub async fn reconcile_once(&mut self) -> Result<(WatchedTree, CycleOutcome)> {
        let watched = self.watcher.watch(&self.config.scope_path).await?;
        debug!(
            nodes = watched.tree().node_count(),
            "Mirrored tree:\n{}",
            watched.tree().outline()
        );

        let snapshot = build_snapshot(watched.tree())?;
        let rendered = render(&snapshot, &self.config.render);

        if self.last_applied.as_ref() == Some(&rendered) {
            debug!("Configuration unchanged");
            return Ok((watched, CycleOutcome::Unchanged));
        }

        let outcome = match self.apply(&rendered).await {
            Ok(()) => {
                info!(
                    primary = snapshot.primary.as_ref().map(|b| b.id.as_str()),
                    replicas = snapshot.replicas.len(),
                    "Applied new configuration:\n{rendered}"
                );
                self.last_applied = Some(rendered);
                CycleOutcome::Applied
            }
            Err(e) if e.is_apply_error() => {
                warn!(error = %e, "Failed to apply configuration, previous one stays in effect");
                CycleOutcome::ApplyFailed
            }
            Err(e) => return Err(e),
        };
        Ok((watched, outcome))
    }

    async fn apply(&mut self, rendered: &RenderedConfig) -> Result<()> {
        let artifact = self.config.artifact_path.as_path();
        write_artifact(artifact, rendered.as_bytes()).await?;

        self.supervisor
            .ensure_started(artifact)
            .await
            .map_err(Error::StartFailed)?;
        self.supervisor
            .reload(artifact)
            .await
            .map_err(Error::ReloadFailed)
    }

    /// Record a failed step and sleep before the retry.
    ///
    /// Returns `Ok(false)` if the loop was stopped while backing off.
    async fn back_off(&mut self, err: Error, backoff: &mut Backoff) -> Result<bool> {
        if err.is_fatal() || self.config.stop_on_error {
            return Err(err);
        }

        backoff.failures = backoff.failures.saturating_add(1);
        if backoff.failures >= self.config.max_errors {
            error!(max = self.config.max_errors, "Max errors reached, stopping loop");
            return Err(Error::max_errors(self.config.max_errors, &err));
        }

        let delay = backoff.next_delay();
        warn!(
            error = %err,
            consecutive = backoff.failures,
            retry_in_ms = delay.as_millis(),
            "Reconcile cycle failed, backing off"
        );
        self.set_phase(LoopPhase::BackingOff);

        let mut stop_rx = self.stop_rx.clone();
        tokio::select! {
            () = tokio::time::sleep(delay) => Ok(true),
            () = stop_requested(&mut stop_rx) => Ok(false),
        }
    }

    async fn idle(&mut self, tree: &mut WatchedTree) -> Wake {
        let mut stop_rx = self.stop_rx.clone();
        let mut liveness = liveness_timer(self.config.liveness_interval);

        loop {
            tokio::select! {
                change = tree.changed() => {
                    match change {
                        Some(change) => info!(
                            path = %change.path,
                            kind = ?change.kind,
                            event = ?change.event,
                            "Change detected"
                        ),
                        None => warn!("Watches ended without reporting a change"),
                    }
                    return Wake::Changed;
                }
                () = next_tick(liveness.as_mut()) => {
                    if !self.supervisor.is_running() {
                        warn!(
                            pid = ?self.supervisor.handle().pid,
                            "Managed process exited, re-applying configuration"
                        );
                        self.last_applied = None;
                        return Wake::ProcessExited;
                    }
                }
                () = stop_requested(&mut stop_rx) => return Wake::Stopped,
            }
        }
    }

    /// Stop the loop.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Get a stopper handle.
    pub fn stopper(&self) -> LoopStopper {
        LoopStopper {
            stop_tx: self.stop_tx.clone(),
        }
    }
}

/// Handle to stop a reconcile loop.
#[derive(Clone)]
pub struct LoopStopper {
    stop_tx: watch::Sender<bool>,
}

impl LoopStopper {
    /// Stop the loop.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }
}

async fn stop_requested(stop_rx: &mut watch::Receiver<bool>) {
    // A closed channel counts as a stop.
    let _ = stop_rx.wait_for(|stopped| *stopped).await;
}

fn liveness_timer(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    let mut timer = tokio::time::interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(timer)
}

async fn next_tick(timer: Option<&mut Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}
