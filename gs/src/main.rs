//! gitsync - configuration-synchronized process supervisor
//!
//! CLI entry point: sync the worker's configuration, then supervise it.

use std::io::IsTerminal;

use clap::Parser;
use eyre::{Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use gitsync::cli::{Cli, Command};
use gitsync::config::Config;
use gitsync::credentials::{AuthRequirement, CredentialError, resolve};
use gitsync::poll::PollLoop;
use gitsync::supervisor::ProcessSupervisor;
use gitsync::sync::ConfigSync;
use gitsync::worker::WorkerLauncher;

fn setup_logging(log_level: Option<&str>) {
    // Note: Can't log params here since logging isn't initialized yet
    let level = match log_level.map(str::to_uppercase).as_deref() {
        Some("TRACE") => tracing::Level::TRACE,
        Some("DEBUG") => tracing::Level::DEBUG,
        Some("WARN") | Some("WARNING") => tracing::Level::WARN,
        Some("ERROR") => tracing::Level::ERROR,
        Some("INFO") | None => tracing::Level::INFO,
        Some(other) => {
            eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", other);
            tracing::Level::INFO
        }
    };

    // stdout belongs to the worker
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    debug!("Logging initialized (level: {:?})", level);
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.log_level.as_deref());

    let mut config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    config.apply(&cli.overrides);
    config.validate().context("Invalid configuration")?;
    debug!(?config, "main: effective configuration");

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            debug!("main: matched Run command");
            cmd_run(&config).await
        }
        Command::Check => {
            debug!("main: matched Check command");
            cmd_check(&config)
        }
    }
}

/// Sync and supervise until a signal or a fatal error
async fn cmd_run(config: &Config) -> Result<()> {
    debug!("cmd_run: called");
    let launcher = WorkerLauncher::new(config.worker.program.clone());
    let supervisor = ProcessSupervisor::new(launcher, config.config_location(), config.worker.log_file.clone())
        .with_grace_period(config.worker.grace_period())
        .with_orphan_scan(config.worker.scan_orphans);

    let mut poll = PollLoop::new(ConfigSync::new(), config.sync_target(), supervisor, config.poll.mode())
        .with_interval(config.poll.interval());

    let shutdown_rx = spawn_signal_listener().context("Failed to install signal handlers")?;
    poll.run(shutdown_rx).await?;

    info!("gitsync stopped");
    Ok(())
}

/// Exit code when a second signal cuts a graceful stop short
const FORCED_EXIT_CODE: i32 = 130;

/// Forward SIGINT/SIGTERM to the poll loop as a shutdown request
///
/// The first signal asks for a graceful stop; a second one exits at once.
fn spawn_signal_listener() -> Result<mpsc::Receiver<()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

    tokio::spawn(async move {
        let mut received = 0u32;
        loop {
            tokio::select! {
                _ = sigint.recv() => {
                    debug!(received, "spawn_signal_listener: SIGINT received");
                    warn!("SIGINT received");
                }
                _ = sigterm.recv() => {
                    debug!(received, "spawn_signal_listener: SIGTERM received");
                    warn!("SIGTERM received");
                }
            }
            received += 1;

            if received > 1 {
                error!("Second signal received, exiting without waiting for the worker");
                std::process::exit(FORCED_EXIT_CODE);
            }
            info!("Stopping worker gracefully; signal again to exit immediately");
            let _ = shutdown_tx.send(()).await;
        }
    });

    Ok(shutdown_rx)
}

/// Validate settings and print a redacted summary
fn cmd_check(config: &Config) -> Result<()> {
    debug!("cmd_check: called");
    let launcher = WorkerLauncher::new(config.worker.program.clone());
    let location = config.config_location();
    let config_path = launcher.validate(&location)?;

    let target = config.sync_target();
    let remote = match resolve(&target, AuthRequirement::Optional) {
        Ok(uri) => uri.to_string(),
        Err(CredentialError::MissingTarget) => "(none)".to_string(),
        Err(e) => return Err(e).context("Failed to resolve credentials"),
    };

    println!("worker:      {}", launcher.program());
    println!("base path:   {}", location.base_path().display());
    println!("config file: {}", config_path.display());
    match &config.worker.log_file {
        Some(log_file) => println!("log file:    {}", log_file.display()),
        None => println!("log file:    (none)"),
    }
    println!("remote:      {}", remote);
    println!(
        "sync:        {}",
        if target.has_source() {
            "enabled"
        } else {
            "disabled (no token configured)"
        }
    );
    println!("mode:        {:?}", config.poll.mode());
    println!("interval:    {}s", config.poll.interval_secs);
    Ok(())
}
