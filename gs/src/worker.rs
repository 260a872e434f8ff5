//! Worker launch and handle types

use std::path::{Component, Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Error types for starting the worker
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("Base directory {0} does not exist; check the base path setting (IMAPFILTER_HOME)")]
    MissingBaseDirectory(PathBuf),

    #[error("Configuration file {0} does not exist; check the config file setting (IMAPFILTER_CONFIG)")]
    MissingConfigFile(PathBuf),

    #[error("Failed to start worker `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// The worker's configuration file, always relative to its base directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigLocation {
    base_path: PathBuf,
    relative_file: PathBuf,
}

impl ConfigLocation {
    /// Build a location; an absolute config path is made relative to `base_path`
    ///
    /// A path under `base_path` loses that prefix, any other absolute path
    /// loses its root and lands under `base_path` as well.
    pub fn new(base_path: impl Into<PathBuf>, config_file: impl Into<PathBuf>) -> Self {
        let base_path = base_path.into();
        let config_file = config_file.into();
        let relative_file = if config_file.is_absolute() {
            match config_file.strip_prefix(&base_path) {
                Ok(inside) => inside.to_path_buf(),
                Err(_) => {
                    warn!(
                        ?config_file,
                        ?base_path,
                        "Config file is outside the base path, resolving it under the base path"
                    );
                    config_file
                        .components()
                        .filter(|c| !matches!(c, Component::RootDir | Component::Prefix(_)))
                        .collect()
                }
            }
        } else {
            config_file
        };
        debug!(?base_path, ?relative_file, "ConfigLocation::new: normalized");
        Self {
            base_path,
            relative_file,
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn relative_file(&self) -> &Path {
        &self.relative_file
    }

    /// Full path to the configuration file
    pub fn resolved(&self) -> PathBuf {
        self.base_path.join(&self.relative_file)
    }
}

/// Lifecycle of a worker instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    NotStarted,
    Running,
    Stopping,
    Stopped,
}

/// The supervisor's view of one worker process
#[derive(Debug)]
pub struct WorkerHandle {
    pid: Option<u32>,
    state: WorkerState,
    child: Option<Child>,
}

impl Default for WorkerHandle {
    fn default() -> Self {
        Self::not_started()
    }
}

impl WorkerHandle {
    /// A handle that has never had a process
    pub fn not_started() -> Self {
        Self {
            pid: None,
            state: WorkerState::NotStarted,
            child: None,
        }
    }

    fn running(child: Child) -> Self {
        Self {
            pid: child.id(),
            state: WorkerState::Running,
            child: Some(child),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Whether the process may still be holding resources
    pub fn is_active(&self) -> bool {
        matches!(self.state, WorkerState::Running | WorkerState::Stopping)
    }

    pub(crate) fn mark_stopping(&mut self) {
        if self.state == WorkerState::Running {
            self.state = WorkerState::Stopping;
        }
    }

    /// Wait for the process to exit
    ///
    /// Cancel-safe: dropping the future leaves the handle untouched.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        debug!(pid = ?self.pid, "WorkerHandle::wait: called");
        let Some(child) = self.child.as_mut() else {
            return Err(std::io::Error::other("worker was never started"));
        };
        let status = child.wait().await?;
        self.state = WorkerState::Stopped;
        debug!(pid = ?self.pid, %status, "WorkerHandle::wait: exited");
        Ok(status)
    }

    /// Non-blocking exit check; reaps the process if it has exited
    pub fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        let Some(child) = self.child.as_mut() else {
            return Ok(None);
        };
        let status = child.try_wait()?;
        if status.is_some() {
            self.state = WorkerState::Stopped;
        }
        Ok(status)
    }

    /// SIGKILL the process and reap it
    pub async fn kill(&mut self) -> std::io::Result<()> {
        debug!(pid = ?self.pid, "WorkerHandle::kill: called");
        if let Some(child) = self.child.as_mut() {
            child.kill().await?;
        }
        self.state = WorkerState::Stopped;
        Ok(())
    }
}

/// Starts the worker executable against a configuration location
#[derive(Debug, Clone)]
pub struct WorkerLauncher {
    program: String,
}

impl WorkerLauncher {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// The executable name or path
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Check that the base directory and configuration file exist
    ///
    /// Returns the resolved configuration path.
    pub fn validate(&self, location: &ConfigLocation) -> Result<PathBuf, LaunchError> {
        debug!(?location, "WorkerLauncher::validate: called");
        if !location.base_path().is_dir() {
            return Err(LaunchError::MissingBaseDirectory(location.base_path().to_path_buf()));
        }

        let config_path = location.resolved();
        if !config_path.is_file() {
            return Err(LaunchError::MissingConfigFile(config_path));
        }
        Ok(config_path)
    }

    /// Spawn the worker as a child running in the base directory
    ///
    /// Does not wait for it; use [`WorkerHandle::wait`] to block on it.
    pub fn start(&self, location: &ConfigLocation, log_file: Option<&Path>) -> Result<WorkerHandle, LaunchError> {
        let config_path = self.validate(location)?;

        let mut command = Command::new(&self.program);
        command
            .arg("-c")
            .arg(&config_path)
            .current_dir(location.base_path())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(false);
        if let Some(log_file) = log_file {
            command.arg("-l").arg(log_file);
        }

        let child = command.spawn().map_err(|source| LaunchError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        let handle = WorkerHandle::running(child);
        info!(
            pid = ?handle.pid(),
            program = %self.program,
            config = %config_path.display(),
            "Worker started"
        );
        Ok(handle)
    }
}
