//! gitsync configuration types and loading
//!
//! Values come from an optional YAML file and are then overridden by
//! command-line flags / environment variables (see [`crate::cli`]).

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cli::Overrides;
use crate::credentials::SyncTarget;
use crate::poll::Mode;
use crate::worker::ConfigLocation;

/// Main gitsync configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Remote repository and credentials
    pub git: GitConfig,

    /// Worker executable and its configuration
    pub worker: WorkerConfig,

    /// Poll loop behaviour
    #[serde(rename = "loop")]
    pub poll: LoopConfig,
}

impl Config {
    /// Validate configuration before use
    pub fn validate(&self) -> Result<()> {
        if self.poll.interval_secs == 0 {
            return Err(eyre::eyre!("Poll interval must be at least one second"));
        }
        if self.worker.program.trim().is_empty() {
            return Err(eyre::eyre!("Worker executable must not be empty"));
        }
        Ok(())
    }

    /// Load configuration with fallback chain
    ///
    /// An explicit `--config` must load. Otherwise the first file found in
    /// [`Config::search_paths`] wins; an unparsable one is skipped with a
    /// warning. Flags and environment variables are applied on top later.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            let config = Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()))?;
            tracing::info!(layer = "--config", path = %path.display(), "Using gitsync config");
            return Ok(config);
        }

        for (layer, path) in Self::search_paths() {
            if !path.exists() {
                tracing::debug!(layer, path = %path.display(), "Config::load: not present");
                continue;
            }
            match Self::load_from_file(&path) {
                Ok(config) => {
                    tracing::info!(layer, path = %path.display(), "Using gitsync config");
                    return Ok(config);
                }
                Err(e) => {
                    tracing::warn!(layer, path = %path.display(), "Ignoring gitsync config: {:#}", e);
                }
            }
        }

        let config = Self::default();
        tracing::info!(
            worker = %config.worker.program,
            base_path = %config.worker.base_path.display(),
            "No gitsync config file found, using built-in defaults"
        );
        Ok(config)
    }

    /// Config files tried when no `--config` is given, highest priority first
    pub fn search_paths() -> Vec<(&'static str, PathBuf)> {
        let mut paths = vec![("project", PathBuf::from(".gitsync.yml"))];
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(("user", config_dir.join("gitsync").join("gitsync.yml")));
        }
        paths
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        serde_yaml::from_str(&content).context("Failed to parse config file")
    }

    /// Apply command-line / environment overrides on top of file values
    pub fn apply(&mut self, overrides: &Overrides) {
        fn set<T: Clone>(slot: &mut T, value: &Option<T>) {
            if let Some(value) = value {
                *slot = value.clone();
            }
        }
        fn set_opt<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
            if value.is_some() {
                *slot = value.clone();
            }
        }

        set_opt(&mut self.git.target, &overrides.git_target);
        set_opt(&mut self.git.user, &overrides.git_user);
        set_opt(&mut self.git.token, &overrides.git_token);
        set_opt(&mut self.git.token_file, &overrides.git_token_file);
        set(&mut self.worker.program, &overrides.worker);
        set(&mut self.worker.base_path, &overrides.base_path);
        set(&mut self.worker.config_file, &overrides.config_file);
        set_opt(&mut self.worker.log_file, &overrides.log_file);
        set(&mut self.worker.grace_period_secs, &overrides.grace_period);
        set(&mut self.poll.daemon, &overrides.daemon);
        set(&mut self.poll.interval_secs, &overrides.interval);
    }

    /// Where and how to sync
    pub fn sync_target(&self) -> SyncTarget {
        SyncTarget {
            remote: self.git.target.clone(),
            username: self.git.user.clone(),
            token: self.git.token.clone(),
            token_file: self.git.token_file.clone(),
            base_path: self.worker.base_path.clone(),
        }
    }

    /// The worker's configuration file location
    pub fn config_location(&self) -> ConfigLocation {
        ConfigLocation::new(&self.worker.base_path, &self.worker.config_file)
    }
}

/// Remote repository configuration
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    /// Remote location, optionally with a scheme prefix
    pub target: Option<String>,

    /// Username prepended to the token
    pub user: Option<String>,

    /// Raw token value
    #[serde(skip_serializing)]
    pub token: Option<String>,

    /// File containing the token
    #[serde(rename = "token-file")]
    pub token_file: Option<PathBuf>,
}

impl fmt::Debug for GitConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitConfig")
            .field("target", &self.target)
            .field("user", &self.user)
            .field("token", &self.token.as_ref().map(|_| "***"))
            .field("token_file", &self.token_file)
            .finish()
    }
}

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker executable name or path
    pub program: String,

    /// Directory holding the synchronized configuration; the worker runs here
    #[serde(rename = "base-path")]
    pub base_path: PathBuf,

    /// Entry configuration file, relative to the base path
    #[serde(rename = "config-file")]
    pub config_file: PathBuf,

    /// Log file forwarded to the worker with `-l`
    #[serde(rename = "log-file")]
    pub log_file: Option<PathBuf>,

    /// Seconds between SIGTERM and SIGKILL
    #[serde(rename = "grace-period-secs")]
    pub grace_period_secs: u64,

    /// Also stop same-named processes the supervisor does not track
    #[serde(rename = "scan-orphans")]
    pub scan_orphans: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: "imapfilter".to_string(),
            base_path: PathBuf::from("/opt/imapfilter/config"),
            config_file: PathBuf::from("config.lua"),
            log_file: None,
            grace_period_secs: 5,
            scan_orphans: true,
        }
    }
}

impl WorkerConfig {
    /// Get the grace period as a Duration
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

/// Poll loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Keep one worker running instead of running it once per cycle
    pub daemon: bool,

    /// Polling interval in seconds
    #[serde(rename = "interval-secs")]
    pub interval_secs: u64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            daemon: false,
            interval_secs: 30,
        }
    }
}

impl LoopConfig {
    /// Get the poll interval as a Duration
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn mode(&self) -> Mode {
        Mode::from_daemon_flag(self.daemon)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.worker.program, "imapfilter");
        assert_eq!(config.worker.base_path, PathBuf::from("/opt/imapfilter/config"));
        assert_eq!(config.worker.config_file, PathBuf::from("config.lua"));
        assert_eq!(config.worker.grace_period(), Duration::from_secs(5));
        assert_eq!(config.poll.interval(), Duration::from_secs(30));
        assert_eq!(config.poll.mode(), Mode::PerCycle);
        assert!(config.git.target.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_config() {
        let yaml = r#"
git:
  target: github.com/acme/mail-rules.git
  user: deploy
  token-file: /run/secrets/git_token

worker:
  program: /usr/local/bin/imapfilter
  base-path: /srv/imapfilter
  config-file: rules/main.lua
  log-file: /var/log/imapfilter.log
  grace-period-secs: 2
  scan-orphans: false

loop:
  daemon: true
  interval-secs: 60
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.git.target.as_deref(), Some("github.com/acme/mail-rules.git"));
        assert_eq!(config.git.token_file, Some(PathBuf::from("/run/secrets/git_token")));
        assert_eq!(config.worker.base_path, PathBuf::from("/srv/imapfilter"));
        assert_eq!(config.worker.log_file, Some(PathBuf::from("/var/log/imapfilter.log")));
        assert!(!config.worker.scan_orphans);
        assert_eq!(config.poll.mode(), Mode::Daemon);
        assert_eq!(config.poll.interval_secs, 60);

        let location = config.config_location();
        assert_eq!(location.resolved(), PathBuf::from("/srv/imapfilter/rules/main.lua"));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let yaml = r#"
loop:
  daemon: true
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert!(config.poll.daemon);
        assert_eq!(config.poll.interval_secs, 30);
        assert_eq!(config.worker.program, "imapfilter");
    }

    #[test]
    fn test_overrides_win_over_file() {
        let mut config = Config::default();
        config.poll.interval_secs = 60;
        config.git.target = Some("file-target".to_string());

        let overrides = Overrides {
            git_target: Some("env-target".to_string()),
            git_token: Some("t0k".to_string()),
            base_path: Some(PathBuf::from("/srv/config")),
            config_file: Some(PathBuf::from("/srv/config/main.lua")),
            daemon: Some(true),
            ..Default::default()
        };
        config.apply(&overrides);

        assert_eq!(config.git.target.as_deref(), Some("env-target"));
        assert_eq!(config.poll.interval_secs, 60);
        assert!(config.poll.daemon);

        let target = config.sync_target();
        assert!(target.has_source());
        assert_eq!(target.base_path, PathBuf::from("/srv/config"));
        assert_eq!(config.config_location().relative_file(), Path::new("main.lua"));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut config = Config::default();
        config.poll.interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_token_not_in_debug_or_yaml() {
        let mut config = Config::default();
        config.git.token = Some("hunter2".to_string());

        assert!(!format!("{:?}", config).contains("hunter2"));
        assert!(!serde_yaml::to_string(&config).unwrap().contains("hunter2"));
    }

    #[test]
    fn test_load_explicit_missing_file_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("nope.yml");
        assert!(Config::load(Some(&missing)).is_err());
    }

    #[test]
    fn test_search_paths_prefer_project_file() {
        let paths = Config::search_paths();
        assert_eq!(paths[0], ("project", PathBuf::from(".gitsync.yml")));
        if let Some((layer, path)) = paths.get(1) {
            assert_eq!(*layer, "user");
            assert!(path.ends_with("gitsync/gitsync.yml"));
        }
    }

    #[test]
    fn test_load_explicit_unparsable_file_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("gitsync.yml");
        fs::write(&path, "loop: [not, a, map]\n").unwrap();

        let err = Config::load(Some(&path)).unwrap_err();
        assert!(format!("{:#}", err).contains("parse"));
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("gitsync.yml");
        fs::write(&path, "loop:\n  interval-secs: 5\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.poll.interval_secs, 5);
    }
}
