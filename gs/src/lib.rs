//! gitsync - configuration-synchronized process supervisor
//!
//! gitsync keeps a worker's configuration directory in sync with a git
//! remote and restarts the worker whenever a pull actually brings in new
//! commits. An unexpected worker death is treated as fatal rather than
//! silently respawned.
//!
//! # Modules
//!
//! - [`credentials`] - Authenticated remote URI construction
//! - [`vcs`] - Version-control client seam and the `git` CLI implementation
//! - [`sync`] - Clone / fast-forward pull with change detection
//! - [`worker`] - Worker launch and handle types
//! - [`supervisor`] - Worker lifecycle: graceful restart and liveness
//! - [`poll`] - The daemon and per-cycle poll loops
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod cli;
pub mod config;
pub mod credentials;
pub mod poll;
pub mod supervisor;
pub mod sync;
pub mod vcs;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use config::{Config, GitConfig, LoopConfig, WorkerConfig};
pub use credentials::{AuthRequirement, AuthenticatedUri, CredentialError, SyncTarget, resolve};
pub use poll::{Mode, PollError, PollLoop};
pub use supervisor::{DEFAULT_GRACE_PERIOD, ProcessSupervisor, SupervisorError};
pub use sync::{ConfigSync, SyncError, SyncOutcome};
pub use vcs::{CommandExecutor, CommandResult, GitCli, ProcessCommandExecutor, PullResult, VcsClient, VcsError};
pub use worker::{ConfigLocation, LaunchError, WorkerHandle, WorkerLauncher, WorkerState};
