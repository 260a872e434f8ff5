//! Version-control client seam
//!
//! [`VcsClient`] is what [`crate::sync::ConfigSync`] talks to. [`GitCli`]
//! implements it on top of the `git` binary; change detection compares the
//! commit at HEAD before and after a pull instead of parsing git's
//! human-readable output.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::credentials::AuthenticatedUri;

/// Error types for version-control operations
#[derive(Debug, thiserror::Error)]
pub enum VcsError {
    #[error("Failed to run `{command}`: {message}")]
    SpawnFailed { command: String, message: String },

    #[error("`{command}` failed with code {code:?}: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}

/// Result of a fast-forward pull
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullResult {
    /// HEAD did not move
    UpToDate,
    /// HEAD moved from one commit to another
    Updated { from: String, to: String },
}

/// Operations the sync layer needs from a version-control client
#[async_trait]
pub trait VcsClient: Send + Sync {
    /// Whether `path` is already a working directory
    fn is_working_copy(&self, path: &Path) -> bool;

    /// Clone the remote into `path`
    async fn clone_repo(&self, uri: &AuthenticatedUri, path: &Path) -> Result<(), VcsError>;

    /// Fast-forward-only pull of `uri` into the working directory at `path`
    async fn pull_fast_forward(&self, uri: &AuthenticatedUri, path: &Path) -> Result<PullResult, VcsError>;
}

/// Raw outcome of an external command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Runs external programs; swapped for a scripted executor in tests
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, program: &str, args: &[String], cwd: &Path) -> std::io::Result<CommandResult>;
}

/// Executes commands as real child processes, never prompting for input
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessCommandExecutor;

#[async_trait]
impl CommandExecutor for ProcessCommandExecutor {
    async fn execute(&self, program: &str, args: &[String], cwd: &Path) -> std::io::Result<CommandResult> {
        let output = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(std::process::Stdio::null())
            .output()
            .await?;

        Ok(CommandResult {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// [`VcsClient`] backed by the `git` command-line tool
#[derive(Debug, Clone)]
pub struct GitCli<E = ProcessCommandExecutor> {
    program: String,
    executor: E,
}

impl Default for GitCli<ProcessCommandExecutor> {
    fn default() -> Self {
        Self::new()
    }
}

impl GitCli<ProcessCommandExecutor> {
    /// Use the `git` found on `PATH`
    pub fn new() -> Self {
        Self {
            program: "git".to_string(),
            executor: ProcessCommandExecutor,
        }
    }
}

impl<E: CommandExecutor> GitCli<E> {
    /// Use a custom executor
    pub fn with_executor(executor: E) -> Self {
        Self {
            program: "git".to_string(),
            executor,
        }
    }

    /// Commit id at HEAD of the working directory
    pub async fn head(&self, path: &Path) -> Result<String, VcsError> {
        let output = self
            .run(vec!["rev-parse".to_string(), "HEAD".to_string()], path, None)
            .await?;
        Ok(output.trim().to_string())
    }

    async fn run(&self, args: Vec<String>, cwd: &Path, uri: Option<&AuthenticatedUri>) -> Result<String, VcsError> {
        let scrub = |text: &str| match uri {
            Some(uri) => uri.redact(text),
            None => text.to_string(),
        };
        let command = scrub(&format!("{} {}", self.program, args.join(" ")));
        debug!(%command, ?cwd, "GitCli::run: called");

        let result = self
            .executor
            .execute(&self.program, &args, cwd)
            .await
            .map_err(|e| VcsError::SpawnFailed {
                command: command.clone(),
                message: e.to_string(),
            })?;

        if result.success {
            debug!(%command, "GitCli::run: succeeded");
            return Ok(result.stdout);
        }

        let stderr = if result.stderr.trim().is_empty() {
            result.stdout
        } else {
            result.stderr
        };
        debug!(%command, code = ?result.code, "GitCli::run: failed");
        Err(VcsError::CommandFailed {
            command,
            code: result.code,
            stderr: scrub(stderr.trim()),
        })
    }
}

#[async_trait]
impl<E: CommandExecutor> VcsClient for GitCli<E> {
    fn is_working_copy(&self, path: &Path) -> bool {
        let result = path.join(".git").exists();
        debug!(?path, result, "GitCli::is_working_copy: checked");
        result
    }

    async fn clone_repo(&self, uri: &AuthenticatedUri, path: &Path) -> Result<(), VcsError> {
        debug!(%uri, ?path, "GitCli::clone_repo: called");
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        tokio::fs::create_dir_all(&parent)
            .await
            .map_err(|e| VcsError::SpawnFailed {
                command: format!("mkdir -p {}", parent.display()),
                message: e.to_string(),
            })?;

        let args = vec![
            "clone".to_string(),
            "--quiet".to_string(),
            uri.expose(),
            path.to_string_lossy().into_owned(),
        ];
        self.run(args, &parent, Some(uri)).await?;
        info!(%uri, ?path, "Cloned configuration repository");

        // Keep the token out of .git/config; every pull passes the URI explicitly
        if uri.is_authenticated() {
            let args = vec![
                "remote".to_string(),
                "set-url".to_string(),
                "origin".to_string(),
                uri.public(),
            ];
            if let Err(e) = self.run(args, path, Some(uri)).await {
                warn!(error = %e, "Failed to strip credentials from origin remote");
            }
        }

        Ok(())
    }

    async fn pull_fast_forward(&self, uri: &AuthenticatedUri, path: &Path) -> Result<PullResult, VcsError> {
        debug!(%uri, ?path, "GitCli::pull_fast_forward: called");
        let before = self.head(path).await?;

        let args = vec![
            "pull".to_string(),
            "--ff-only".to_string(),
            "--quiet".to_string(),
            uri.expose(),
        ];
        self.run(args, path, Some(uri)).await?;

        let after = self.head(path).await?;
        if before == after {
            debug!(sha = %after, "GitCli::pull_fast_forward: HEAD unchanged");
            return Ok(PullResult::UpToDate);
        }

        debug!(from = %before, to = %after, "GitCli::pull_fast_forward: HEAD moved");
        Ok(PullResult::Updated { from: before, to: after })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{AuthRequirement, SyncTarget, resolve};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Invocation {
        program: String,
        args: Vec<String>,
        cwd: PathBuf,
    }

    #[derive(Clone)]
    struct MockExecutor {
        calls: Arc<Mutex<Vec<Invocation>>>,
        responses: Arc<Mutex<VecDeque<std::io::Result<CommandResult>>>>,
    }

    impl MockExecutor {
        fn new(responses: Vec<std::io::Result<CommandResult>>) -> Self {
            Self {
                calls: Arc::new(Mutex::new(Vec::new())),
                responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            }
        }

        fn calls(&self) -> Vec<Invocation> {
            self.calls.lock().expect("mock calls lock poisoned").clone()
        }
    }

    #[async_trait]
    impl CommandExecutor for MockExecutor {
        async fn execute(&self, program: &str, args: &[String], cwd: &Path) -> std::io::Result<CommandResult> {
            self.calls.lock().expect("mock calls lock poisoned").push(Invocation {
                program: program.to_string(),
                args: args.to_vec(),
                cwd: cwd.to_path_buf(),
            });
            self.responses
                .lock()
                .expect("mock responses lock poisoned")
                .pop_front()
                .expect("missing mock response")
        }
    }

    fn ok(stdout: &str) -> std::io::Result<CommandResult> {
        Ok(CommandResult {
            success: true,
            code: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
        })
    }

    fn failed(code: i32, stderr: &str) -> std::io::Result<CommandResult> {
        Ok(CommandResult {
            success: false,
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.to_string(),
        })
    }

    fn uri(token: Option<&str>) -> AuthenticatedUri {
        let target = SyncTarget {
            remote: Some("git.example.org/rules.git".to_string()),
            token: token.map(str::to_string),
            ..SyncTarget::local("/unused")
        };
        resolve(&target, AuthRequirement::Optional).unwrap()
    }

    #[tokio::test]
    async fn test_pull_reports_up_to_date_when_head_unchanged() {
        let mock = MockExecutor::new(vec![ok("abc\n"), ok(""), ok("abc\n")]);
        let git = GitCli::with_executor(mock.clone());

        let result = git.pull_fast_forward(&uri(Some("t0k")), Path::new("/srv/config")).await;
        assert_eq!(result.unwrap(), PullResult::UpToDate);

        let calls = mock.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[1].args[..3], ["pull", "--ff-only", "--quiet"]);
        assert_eq!(calls[1].args[3], "https://t0k@git.example.org/rules.git");
        assert_eq!(calls[1].cwd, PathBuf::from("/srv/config"));
    }

    #[tokio::test]
    async fn test_pull_reports_update_when_head_moves() {
        let mock = MockExecutor::new(vec![ok("abc\n"), ok(""), ok("def\n")]);
        let git = GitCli::with_executor(mock);

        let result = git.pull_fast_forward(&uri(None), Path::new("/srv/config")).await;
        assert_eq!(
            result.unwrap(),
            PullResult::Updated {
                from: "abc".to_string(),
                to: "def".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_pull_failure_redacts_token() {
        let mock = MockExecutor::new(vec![
            ok("abc\n"),
            failed(128, "fatal: Authentication failed for 'https://t0k@git.example.org/rules.git'"),
        ]);
        let git = GitCli::with_executor(mock);

        let err = git
            .pull_fast_forward(&uri(Some("t0k")), Path::new("/srv/config"))
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(!message.contains("t0k"));
        assert!(message.contains("Authentication failed"));
        assert!(matches!(err, VcsError::CommandFailed { code: Some(128), .. }));
    }

    #[tokio::test]
    async fn test_clone_strips_credentials_from_origin() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("config");
        let mock = MockExecutor::new(vec![ok(""), ok("")]);
        let git = GitCli::with_executor(mock.clone());

        git.clone_repo(&uri(Some("t0k")), &target).await.unwrap();

        let calls = mock.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].program, "git");
        assert_eq!(calls[0].args[0], "clone");
        assert_eq!(calls[0].cwd, dir.path());
        assert_eq!(
            calls[1].args,
            ["remote", "set-url", "origin", "https://git.example.org/rules.git"]
        );
        assert_eq!(calls[1].cwd, target);
    }

    #[tokio::test]
    async fn test_clone_without_token_skips_set_url() {
        let dir = TempDir::new().unwrap();
        let mock = MockExecutor::new(vec![ok("")]);
        let git = GitCli::with_executor(mock.clone());

        git.clone_repo(&uri(None), &dir.path().join("config")).await.unwrap();
        assert_eq!(mock.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let mock = MockExecutor::new(vec![Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "git not found",
        ))]);
        let git = GitCli::with_executor(mock);

        let err = git.head(Path::new("/srv/config")).await.unwrap_err();
        assert!(matches!(err, VcsError::SpawnFailed { .. }));
    }

    #[test]
    fn test_is_working_copy() {
        let dir = TempDir::new().unwrap();
        let git = GitCli::new();
        assert!(!git.is_working_copy(dir.path()));

        std::fs::create_dir(dir.path().join(".git")).unwrap();
        assert!(git.is_working_copy(dir.path()));
    }
}
