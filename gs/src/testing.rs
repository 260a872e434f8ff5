//! Shared test fixtures

use std::collections::VecDeque;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::credentials::AuthenticatedUri;
use crate::vcs::{PullResult, VcsClient, VcsError};

#[derive(Default)]
struct ScriptedState {
    cloned: bool,
    clone_fails: bool,
    clone_files: Vec<(String, String)>,
    pulls: VecDeque<Result<PullResult, VcsError>>,
    clone_calls: usize,
    pull_calls: usize,
    last_uri: Option<String>,
}

/// In-memory [`VcsClient`]; pulls are up to date unless scripted otherwise
#[derive(Clone, Default)]
pub(crate) struct ScriptedVcs {
    state: Arc<Mutex<ScriptedState>>,
}

impl ScriptedVcs {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn failing_clone(self) -> Self {
        self.lock().clone_fails = true;
        self
    }

    pub(crate) fn with_pulls(self, pulls: Vec<Result<PullResult, VcsError>>) -> Self {
        self.lock().pulls = pulls.into();
        self
    }

    /// Files written into the target directory when a clone succeeds
    pub(crate) fn with_clone_files(self, files: &[(&str, &str)]) -> Self {
        self.lock().clone_files = files.iter().map(|(n, c)| (n.to_string(), c.to_string())).collect();
        self
    }

    pub(crate) fn mark_cloned(&self) {
        self.lock().cloned = true;
    }

    pub(crate) fn clone_calls(&self) -> usize {
        self.lock().clone_calls
    }

    pub(crate) fn pull_calls(&self) -> usize {
        self.lock().pull_calls
    }

    pub(crate) fn last_uri(&self) -> Option<String> {
        self.lock().last_uri.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptedState> {
        self.state.lock().expect("scripted vcs lock poisoned")
    }
}

#[async_trait]
impl VcsClient for ScriptedVcs {
    fn is_working_copy(&self, _path: &Path) -> bool {
        self.lock().cloned
    }

    async fn clone_repo(&self, uri: &AuthenticatedUri, path: &Path) -> Result<(), VcsError> {
        let mut state = self.lock();
        state.clone_calls += 1;
        state.last_uri = Some(uri.expose());
        if state.clone_fails {
            return Err(VcsError::CommandFailed {
                command: "git clone".to_string(),
                code: Some(128),
                stderr: "fatal: repository not found".to_string(),
            });
        }
        std::fs::create_dir_all(path).expect("create clone dir");
        for (name, contents) in &state.clone_files {
            std::fs::write(path.join(name), contents).expect("write cloned file");
        }
        state.cloned = true;
        Ok(())
    }

    async fn pull_fast_forward(&self, uri: &AuthenticatedUri, _path: &Path) -> Result<PullResult, VcsError> {
        let mut state = self.lock();
        state.pull_calls += 1;
        state.last_uri = Some(uri.expose());
        state.pulls.pop_front().unwrap_or(Ok(PullResult::UpToDate))
    }
}

/// Write an executable `/bin/sh` script standing in for the worker binary
pub(crate) fn worker_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write worker script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod worker script");
    path
}

/// A script that records its pid and arguments in its working directory, then idles
pub(crate) const IDLE_WORKER: &str = r#"echo $$ > worker.pid
printf '%s\n' "$*" > worker.args
while true; do sleep 1; done"#;

/// Read the pid an [`IDLE_WORKER`] wrote, waiting briefly for it to appear
pub(crate) async fn read_worker_pid(base: &Path) -> u32 {
    let path = base.join("worker.pid");
    for _ in 0..50 {
        let pid = std::fs::read_to_string(&path).ok().and_then(|c| c.trim().parse().ok());
        if let Some(pid) = pid {
            return pid;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    panic!("worker never wrote {}", path.display());
}
