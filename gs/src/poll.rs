//! The poll loop driving sync and supervision
//!
//! Two modes, chosen once at startup:
//!
//! - [`Mode::Daemon`]: one persistent worker, restarted whenever a sync
//!   applies a change; an unexpected worker death ends the loop.
//! - [`Mode::PerCycle`]: the worker runs to completion once per cycle; an
//!   abnormal exit ends the loop.

use std::process::ExitStatus;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::credentials::SyncTarget;
use crate::supervisor::{ProcessSupervisor, SupervisorError};
use crate::sync::{ConfigSync, SyncError, SyncOutcome};
use crate::vcs::{GitCli, VcsClient};

/// Default seconds between poll cycles
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// How the worker is run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Keep one worker running, restart it on configuration change
    Daemon,
    /// Run the worker to completion every cycle
    PerCycle,
}

impl Mode {
    pub fn from_daemon_flag(daemon: bool) -> Self {
        if daemon { Self::Daemon } else { Self::PerCycle }
    }
}

/// Reasons the loop ends with a failure
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("Worker exited abnormally ({0})")]
    WorkerFailed(ExitStatus),

    #[error("Worker (pid {pid:?}) died unexpectedly")]
    WorkerDied { pid: Option<u32> },
}

/// Sequentially syncs configuration and drives the worker
#[derive(Debug)]
pub struct PollLoop<V = GitCli> {
    sync: ConfigSync<V>,
    target: SyncTarget,
    supervisor: ProcessSupervisor,
    mode: Mode,
    interval: Duration,
    cycles: u64,
}

impl<V: VcsClient> PollLoop<V> {
    pub fn new(sync: ConfigSync<V>, target: SyncTarget, supervisor: ProcessSupervisor, mode: Mode) -> Self {
        Self {
            sync,
            target,
            supervisor,
            mode,
            interval: DEFAULT_POLL_INTERVAL,
            cycles: 0,
        }
    }

    /// Override the time slept between cycles
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    /// Completed poll cycles, not counting the initial sync
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Run until a fatal error or a shutdown request
    ///
    /// A message on `shutdown` stops the worker gracefully and returns `Ok(())`.
    /// A closed channel is not a shutdown request.
    pub async fn run(&mut self, mut shutdown: mpsc::Receiver<()>) -> Result<(), PollError> {
        info!(
            mode = ?self.mode,
            interval_secs = self.interval.as_secs_f64(),
            base_path = %self.target.base_path.display(),
            "Poll loop started"
        );

        // Make sure the very first worker sees the freshest configuration
        self.sync_once().await?;

        let result = match self.mode {
            Mode::Daemon => self.run_daemon(&mut shutdown).await,
            Mode::PerCycle => self.run_per_cycle(&mut shutdown).await,
        };
        if let Err(e) = &result {
            error!(error = %e, "Poll loop stopped");
        }
        result
    }

    async fn run_daemon(&mut self, shutdown: &mut mpsc::Receiver<()>) -> Result<(), PollError> {
        debug!("PollLoop::run_daemon: called");
        self.supervisor.restart().await?;

        loop {
            let outcome = self.sync_once().await?;
            if outcome.is_change() {
                info!("Configuration changed, restarting worker");
                self.supervisor.restart().await?;
            }

            if self.pause(shutdown).await {
                self.supervisor.shutdown().await?;
                return Ok(());
            }
            self.cycles += 1;

            if !self.supervisor.is_alive() {
                return Err(PollError::WorkerDied {
                    pid: self.supervisor.pid(),
                });
            }
        }
    }

    async fn run_per_cycle(&mut self, shutdown: &mut mpsc::Receiver<()>) -> Result<(), PollError> {
        debug!("PollLoop::run_per_cycle: called");
        loop {
            self.sync_once().await?;
            self.supervisor.start()?;

            let status = tokio::select! {
                status = self.supervisor.wait() => Some(status?),
                _ = wait_for_shutdown(shutdown) => None,
            };
            let Some(status) = status else {
                self.supervisor.shutdown().await?;
                return Ok(());
            };

            if !status.success() {
                return Err(PollError::WorkerFailed(status));
            }
            debug!(%status, "PollLoop::run_per_cycle: worker finished");

            if self.pause(shutdown).await {
                return Ok(());
            }
            self.cycles += 1;
        }
    }

    async fn sync_once(&mut self) -> Result<SyncOutcome, PollError> {
        let outcome = self.sync.sync(&self.target).await?;
        match &outcome {
            SyncOutcome::NoSourceConfigured => debug!("No git source configured, using configuration on disk"),
            SyncOutcome::UpToDate => debug!("Configuration up to date"),
            SyncOutcome::ChangeApplied => info!("Configuration synchronized"),
            SyncOutcome::Failed(reason) => warn!(%reason, "Configuration sync failed, retrying next cycle"),
        }
        Ok(outcome)
    }

    /// Sleep one interval; true if shutdown was requested meanwhile
    async fn pause(&self, shutdown: &mut mpsc::Receiver<()>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.interval) => false,
            _ = wait_for_shutdown(shutdown) => {
                info!("Shutdown requested");
                true
            }
        }
    }
}

/// Resolves on a shutdown message; never resolves once every sender is gone
async fn wait_for_shutdown(shutdown: &mut mpsc::Receiver<()>) {
    if shutdown.recv().await.is_none() {
        std::future::pending::<()>().await;
    }
}
