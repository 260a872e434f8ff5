//! Configuration synchronization against the remote repository

use std::fmt;
use std::path::PathBuf;

use tracing::{debug, info};

use crate::credentials::{AuthRequirement, CredentialError, SyncTarget, resolve};
use crate::vcs::{GitCli, PullResult, VcsClient, VcsError};

/// What a sync attempt did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// No remote/credential pair configured; the on-disk configuration is used as is
    NoSourceConfigured,
    /// The working directory already matched the remote
    UpToDate,
    /// New configuration landed on disk (first clone or a fast-forward)
    ChangeApplied,
    /// Transient failure; retried on the next poll cycle
    Failed(String),
}

impl SyncOutcome {
    /// Whether the worker should be restarted
    pub fn is_change(&self) -> bool {
        matches!(self, Self::ChangeApplied)
    }
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSourceConfigured => write!(f, "no source configured"),
            Self::UpToDate => write!(f, "up to date"),
            Self::ChangeApplied => write!(f, "change applied"),
            Self::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Sync failures that leave nothing to run the worker with
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Failed to clone configuration into {path}: {source}")]
    CloneFailed {
        path: PathBuf,
        #[source]
        source: VcsError,
    },

    #[error("Cannot clone configuration into {path}: {source}")]
    Credentials {
        path: PathBuf,
        #[source]
        source: CredentialError,
    },
}

/// Keeps the local working directory in step with the remote
#[derive(Debug, Clone, Default)]
pub struct ConfigSync<V = GitCli> {
    vcs: V,
}

impl ConfigSync<GitCli> {
    /// Sync using the `git` binary
    pub fn new() -> Self {
        Self { vcs: GitCli::new() }
    }
}

impl<V: VcsClient> ConfigSync<V> {
    /// Sync using a custom version-control client
    pub fn with_client(vcs: V) -> Self {
        Self { vcs }
    }

    /// The underlying client
    pub fn client(&self) -> &V {
        &self.vcs
    }

    /// Clone if the base path is not a working directory yet, otherwise pull
    ///
    /// Only a failed first clone is an error; a failed pull is reported as
    /// [`SyncOutcome::Failed`] because the previous configuration is still usable.
    pub async fn sync(&self, target: &SyncTarget) -> Result<SyncOutcome, SyncError> {
        debug!(?target, "ConfigSync::sync: called");
        if !target.has_source() {
            debug!("ConfigSync::sync: no source configured");
            return Ok(SyncOutcome::NoSourceConfigured);
        }

        let path = &target.base_path;
        if !self.vcs.is_working_copy(path) {
            let uri = resolve(target, AuthRequirement::Optional).map_err(|source| SyncError::Credentials {
                path: path.clone(),
                source,
            })?;
            info!(%uri, ?path, "Cloning configuration repository");
            self.vcs
                .clone_repo(&uri, path)
                .await
                .map_err(|source| SyncError::CloneFailed {
                    path: path.clone(),
                    source,
                })?;
            return Ok(SyncOutcome::ChangeApplied);
        }

        let uri = match resolve(target, AuthRequirement::Optional) {
            Ok(uri) => uri,
            Err(e) => {
                debug!(error = %e, "ConfigSync::sync: credential resolution failed");
                return Ok(SyncOutcome::Failed(e.to_string()));
            }
        };

        let outcome = match self.vcs.pull_fast_forward(&uri, path).await {
            Ok(PullResult::UpToDate) => SyncOutcome::UpToDate,
            Ok(PullResult::Updated { from, to }) => {
                info!(%from, %to, "Configuration updated");
                SyncOutcome::ChangeApplied
            }
            Err(e) => SyncOutcome::Failed(e.to_string()),
        };
        debug!(%outcome, "ConfigSync::sync: returning");
        Ok(outcome)
    }
}
