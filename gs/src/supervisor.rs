//! Worker process supervision
//!
//! Owns the single [`WorkerHandle`], restarts it gracefully and probes its
//! liveness.

use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use sysinfo::{ProcessStatus, System};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::worker::{ConfigLocation, LaunchError, WorkerHandle, WorkerLauncher, WorkerState};

/// Grace period between SIGTERM and SIGKILL
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// How often an orphan (not our child, so not waitable) is re-probed
const ORPHAN_PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Linux truncates process names to this many bytes
const COMM_LEN: usize = 15;

/// Error types for worker supervision
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("Failed to signal worker {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: nix::Error,
    },

    #[error("Failed to wait for worker {pid:?}: {source}")]
    Wait {
        pid: Option<u32>,
        #[source]
        source: std::io::Error,
    },
}

/// Supervises the worker: at most one live instance at a time
#[derive(Debug)]
pub struct ProcessSupervisor {
    launcher: WorkerLauncher,
    location: ConfigLocation,
    log_file: Option<PathBuf>,
    grace_period: Duration,
    scan_orphans: bool,
    handle: WorkerHandle,
    starts: u64,
}

impl ProcessSupervisor {
    /// Create a supervisor; nothing is started until [`Self::restart`] or [`Self::start`]
    pub fn new(launcher: WorkerLauncher, location: ConfigLocation, log_file: Option<PathBuf>) -> Self {
        debug!(?launcher, ?location, ?log_file, "ProcessSupervisor::new: called");
        Self {
            launcher,
            location,
            log_file,
            grace_period: DEFAULT_GRACE_PERIOD,
            scan_orphans: true,
            handle: WorkerHandle::not_started(),
            starts: 0,
        }
    }

    /// Override the SIGTERM grace period
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Enable or disable the same-named orphan sweep during restarts
    pub fn with_orphan_scan(mut self, scan_orphans: bool) -> Self {
        self.scan_orphans = scan_orphans;
        self
    }

    pub fn state(&self) -> WorkerState {
        self.handle.state()
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.pid()
    }

    /// Number of workers started over the supervisor's lifetime
    pub fn starts(&self) -> u64 {
        self.starts
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Start a worker; any previous instance must already be stopped
    pub fn start(&mut self) -> Result<u32, SupervisorError> {
        debug!(state = ?self.handle.state(), "ProcessSupervisor::start: called");
        debug_assert!(!self.handle.is_active(), "start while a worker is still active");

        self.handle = self.launcher.start(&self.location, self.log_file.as_deref())?;
        self.starts += 1;
        let pid = self.handle.pid().unwrap_or_default();
        debug!(pid, starts = self.starts, "ProcessSupervisor::start: running");
        Ok(pid)
    }

    /// Stop the current worker (and any same-named orphans), then start a new one
    ///
    /// The new worker is only spawned once every targeted process is gone.
    pub async fn restart(&mut self) -> Result<u32, SupervisorError> {
        debug!(pid = ?self.handle.pid(), "ProcessSupervisor::restart: called");
        let orphans = if self.scan_orphans {
            find_orphans(self.launcher.program(), self.handle.pid())
        } else {
            Vec::new()
        };
        if !orphans.is_empty() {
            warn!(?orphans, program = %self.launcher.program(), "Found stray worker processes, stopping them too");
        }

        let deadline = Instant::now() + self.grace_period;
        let orphans = signal_orphans(orphans, Signal::SIGTERM);
        terminate(&mut self.handle, self.grace_period).await?;
        reap_orphans(orphans, deadline).await;

        let pid = self.start()?;
        info!(pid, "Worker restarted");
        Ok(pid)
    }

    /// Non-blocking liveness probe; false if no worker was ever started
    pub fn is_alive(&mut self) -> bool {
        if self.handle.state() == WorkerState::NotStarted {
            debug!("ProcessSupervisor::is_alive: never started");
            return false;
        }

        let alive = match self.handle.try_wait() {
            Ok(Some(status)) => {
                warn!(pid = ?self.handle.pid(), %status, "Worker exited");
                false
            }
            Ok(None) => self.handle.is_active(),
            Err(e) => {
                debug!(error = %e, "ProcessSupervisor::is_alive: try_wait failed, probing pid");
                self.handle.pid().is_some_and(is_process_running)
            }
        };
        debug!(pid = ?self.handle.pid(), alive, "ProcessSupervisor::is_alive: returning");
        alive
    }

    /// Wait for the current worker to exit
    pub async fn wait(&mut self) -> Result<std::process::ExitStatus, SupervisorError> {
        let pid = self.handle.pid();
        self.handle
            .wait()
            .await
            .map_err(|source| SupervisorError::Wait { pid, source })
    }

    /// Best-effort graceful stop when the supervisor itself is going away
    pub async fn shutdown(&mut self) -> Result<(), SupervisorError> {
        debug!(pid = ?self.handle.pid(), "ProcessSupervisor::shutdown: called");
        if self.handle.is_active() {
            info!(pid = ?self.handle.pid(), "Stopping worker");
        }
        terminate(&mut self.handle, self.grace_period).await
    }

    /// Configuration path the worker is started with
    pub fn config_path(&self) -> PathBuf {
        self.location.resolved()
    }

    pub fn log_file(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }
}

/// SIGTERM the worker, wait up to `grace_period`, then SIGKILL
///
/// A handle that is not running is left alone.
pub async fn terminate(handle: &mut WorkerHandle, grace_period: Duration) -> Result<(), SupervisorError> {
    let Some(pid) = handle.pid() else {
        return Ok(());
    };
    // An exit we have not reaped yet still counts as stopped
    if handle.try_wait().map_err(|source| SupervisorError::Wait { pid: Some(pid), source })?.is_some() {
        debug!(pid, "terminate: worker already exited");
        return Ok(());
    }
    if !handle.is_active() {
        return Ok(());
    }

    debug!(pid, "terminate: sending SIGTERM");
    handle.mark_stopping();
    send_signal(pid, Signal::SIGTERM)?;

    match tokio::time::timeout(grace_period, handle.wait()).await {
        Ok(Ok(status)) => {
            debug!(pid, %status, "terminate: worker exited gracefully");
        }
        Ok(Err(source)) => return Err(SupervisorError::Wait { pid: Some(pid), source }),
        Err(_) => {
            warn!(pid, ?grace_period, "Worker did not stop gracefully, sending SIGKILL");
            handle
                .kill()
                .await
                .map_err(|source| SupervisorError::Wait { pid: Some(pid), source })?;
        }
    }
    Ok(())
}

fn send_signal(pid: u32, signal: Signal) -> Result<(), SupervisorError> {
    debug!(pid, ?signal, "send_signal: called");
    match kill(Pid::from_raw(pid as i32), signal) {
        // Already gone
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(source) => Err(SupervisorError::Signal { pid, source }),
    }
}

/// Signal each stray worker; returns the ones that received it
///
/// Processes that are gone or that we may not signal (another user's
/// worker) are dropped with a warning rather than failing the restart.
fn signal_orphans(orphans: Vec<u32>, signal: Signal) -> Vec<u32> {
    orphans
        .into_iter()
        .filter(|&pid| match kill(Pid::from_raw(pid as i32), signal) {
            Ok(()) => true,
            Err(Errno::ESRCH) => false,
            Err(e) => {
                warn!(pid, ?signal, error = %e, "Cannot signal stray worker, leaving it alone");
                false
            }
        })
        .collect()
}

/// Check if a process with the given PID is running
fn is_process_running(pid: u32) -> bool {
    // Sending signal 0 checks if the process exists without affecting it
    let result = kill(Pid::from_raw(pid as i32), None).is_ok();
    debug!(pid, result, "is_process_running: checked");
    result
}

/// Poll orphans until they exit or the deadline passes, then SIGKILL the rest
async fn reap_orphans(mut orphans: Vec<u32>, deadline: Instant) {
    loop {
        orphans.retain(|&pid| is_process_running(pid));
        if orphans.is_empty() || Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(ORPHAN_PROBE_INTERVAL).await;
    }

    for pid in orphans {
        warn!(pid, "Stray worker did not stop gracefully, sending SIGKILL");
        if let Err(e) = send_signal(pid, Signal::SIGKILL) {
            warn!(pid, error = %e, "Failed to kill stray worker");
        }
    }
}

/// Live processes named like the worker, other than `tracked` and ourselves
fn find_orphans(program: &str, tracked: Option<u32>) -> Vec<u32> {
    let name = Path::new(program)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.to_string());
    let truncated: String = name.chars().take(COMM_LEN).collect();
    let own = std::process::id();

    let mut system = System::new();
    system.refresh_processes();

    let mut orphans: Vec<u32> = system
        .processes()
        .iter()
        .filter(|(_, process)| process.name() == name || process.name() == truncated)
        .filter(|(_, process)| process.status() != ProcessStatus::Zombie)
        .map(|(pid, _)| pid.as_u32())
        .filter(|&pid| pid != own && Some(pid) != tracked)
        .collect();
    orphans.sort_unstable();
    debug!(%name, ?orphans, "find_orphans: returning");
    orphans
}
