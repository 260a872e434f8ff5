//! CLI command definitions
//!
//! Every setting can also come from the environment; explicit flags win.

use std::fmt;
use std::path::PathBuf;

use clap::builder::BoolishValueParser;
use clap::{Args, Parser, Subcommand};

/// gitsync - keep a worker's configuration in sync with a git repository
#[derive(Debug, Parser)]
#[command(
    name = "gitsync",
    about = "Sync a worker's configuration from git and restart it on change",
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        env = "GITSYNC_LOG_LEVEL",
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    #[command(flatten)]
    pub overrides: Overrides,

    /// Subcommand to execute; defaults to `run`
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Sync the configuration and supervise the worker (default)
    Run,

    /// Validate settings and credentials without touching the network
    Check,
}

/// Settings that override the config file
#[derive(Clone, Default, Args)]
pub struct Overrides {
    /// Remote repository, optionally with a scheme prefix
    #[arg(long, global = true, env = "GIT_TARGET", value_name = "REMOTE")]
    pub git_target: Option<String>,

    /// Username for the remote
    #[arg(long, global = true, env = "GIT_USER")]
    pub git_user: Option<String>,

    /// Access token for the remote
    #[arg(long, global = true, env = "GIT_TOKEN", hide_env_values = true)]
    pub git_token: Option<String>,

    /// File containing the access token
    #[arg(long, global = true, env = "GIT_TOKEN_FILE", value_name = "PATH")]
    pub git_token_file: Option<PathBuf>,

    /// Worker executable
    #[arg(long, global = true, env = "IMAPFILTER_BIN", value_name = "PROGRAM")]
    pub worker: Option<String>,

    /// Directory holding the synchronized configuration
    #[arg(long, global = true, env = "IMAPFILTER_HOME", value_name = "DIR")]
    pub base_path: Option<PathBuf>,

    /// Worker configuration file, relative to the base path
    #[arg(long, global = true, env = "IMAPFILTER_CONFIG", value_name = "FILE")]
    pub config_file: Option<PathBuf>,

    /// Log file passed to the worker
    #[arg(long, global = true, env = "IMAPFILTER_LOGFILE", value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    /// Keep one long-running worker instead of running it each cycle (`--daemon=false` to disable)
    #[arg(
        long,
        global = true,
        env = "IMAPFILTER_DAEMON",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        value_parser = BoolishValueParser::new(),
    )]
    pub daemon: Option<bool>,

    /// Seconds between polls
    #[arg(long, global = true, env = "IMAPFILTER_SLEEP", value_name = "SECS")]
    pub interval: Option<u64>,

    /// Seconds to wait after SIGTERM before SIGKILL
    #[arg(long, global = true, env = "GITSYNC_GRACE_SECS", value_name = "SECS")]
    pub grace_period: Option<u64>,
}

impl fmt::Debug for Overrides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Overrides")
            .field("git_target", &self.git_target)
            .field("git_user", &self.git_user)
            .field("git_token", &self.git_token.as_ref().map(|_| "***"))
            .field("git_token_file", &self.git_token_file)
            .field("worker", &self.worker)
            .field("base_path", &self.base_path)
            .field("config_file", &self.config_file)
            .field("log_file", &self.log_file)
            .field("daemon", &self.daemon)
            .field("interval", &self.interval)
            .field("grace_period", &self.grace_period)
            .finish()
    }
}

/// Every environment variable the CLI reads
pub const ENV_VARS: &[&str] = &[
    "GIT_TARGET",
    "GIT_USER",
    "GIT_TOKEN",
    "GIT_TOKEN_FILE",
    "IMAPFILTER_BIN",
    "IMAPFILTER_HOME",
    "IMAPFILTER_CONFIG",
    "IMAPFILTER_LOGFILE",
    "IMAPFILTER_DAEMON",
    "IMAPFILTER_SLEEP",
    "GITSYNC_GRACE_SECS",
    "GITSYNC_LOG_LEVEL",
];
