//! deck-daemon: PID-1 supervisor of the sandbox container.
//!
//! Startup order matters: the zombie reaper must be live before anything
//! spawns children, then the heartbeat, the optional entrypoint command, and
//! finally the three serving surfaces (toolbox HTTP, web terminal, SSH).

mod config;
mod entrypoint;
mod heartbeat;
mod session_id;
mod ssh;
mod terminal;
mod toolbox;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::SignalKind;
use tokio::signal::unix::signal;
use tracing::error;
use tracing::info;
use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use deck_core::reap::ProcessRegistry;
use deck_core::reap::install_reaper;
use deck_desktop::DesktopSupervisor;

use crate::config::Config;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(name = "deck-daemon", version, about = "Sandbox supervisor daemon")]
struct Cli {
    /// Entrypoint command to run inside the sandbox. The special pair
    /// `entrypoint logs` prints the captured entrypoint output instead.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    entrypoint: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // PID-1 duty number one; nothing may fork before the reaper is watching.
    let registry = Arc::new(ProcessRegistry::default());
    install_reaper(Arc::clone(&registry)).context("failed to install SIGCHLD reaper")?;

    heartbeat::spawn_heartbeat(VERSION);

    let cli = Cli::parse();
    let cfg = Config::from_env();

    if cli.entrypoint.len() == 2 && cli.entrypoint[0] == "entrypoint" && cli.entrypoint[1] == "logs"
    {
        entrypoint::print_logs(&cfg.entrypoint_log_file_path);
        return Ok(());
    }

    init_logs(&cfg);
    info!(version = VERSION, "starting deck daemon");

    if cfg.user_home_as_workdir {
        match dirs::home_dir() {
            Some(home) => {
                if let Err(err) = std::env::set_current_dir(&home) {
                    warn!(error = %err, "failed to change working directory to home");
                }
            }
            None => warn!("failed to determine home directory"),
        }
    }

    let entrypoint_handle = if cli.entrypoint.is_empty() {
        None
    } else {
        entrypoint::spawn(&cli.entrypoint, &cfg.entrypoint_log_file_path)
    };

    let work_dir = std::env::current_dir().context("failed to get current working directory")?;
    let desktop = Arc::new(DesktopSupervisor::new());
    Arc::clone(&desktop).handle_system_signals();

    let (error_tx, mut error_rx) = tokio::sync::mpsc::channel::<anyhow::Error>(1);

    spawn_server(&error_tx, "toolbox", {
        let registry = Arc::clone(&registry);
        let desktop = Arc::clone(&desktop);
        async move { toolbox::serve(config::TOOLBOX_PORT, registry, desktop).await }
    });

    spawn_server(&error_tx, "terminal", async move {
        terminal::serve(config::TERMINAL_PORT).await
    });

    spawn_server(&error_tx, "ssh", {
        let server = ssh::SshServer::new(work_dir.clone(), work_dir.clone());
        async move { server.serve(config::SSH_PORT).await }
    });

    start_desktop(&desktop);

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT")?;

    tokio::select! {
        Some(err) = error_rx.recv() => {
            error!(error = %err, "server failed");
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM, shutting down gracefully");
        }
        _ = sigint.recv() => {
            info!("received SIGINT, shutting down gracefully");
        }
    }

    info!("stopping desktop processes");
    desktop.stop();

    if let Some(handle) = entrypoint_handle {
        handle.shutdown(&cfg).await;
    }

    info!("shutdown complete");
    Ok(())
}

fn spawn_server<F>(error_tx: &tokio::sync::mpsc::Sender<anyhow::Error>, name: &'static str, run: F)
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let error_tx = error_tx.clone();
    tokio::spawn(async move {
        if let Err(err) = run.await {
            let _ = error_tx
                .send(err.context(format!("{name} server failed")))
                .await;
        }
    });
}

/// The desktop stack is best-effort at boot: a sandbox image without the X11
/// toolchain still gets a working daemon, and the HTTP surface can retry.
fn start_desktop(desktop: &Arc<DesktopSupervisor>) {
    let desktop = Arc::clone(desktop);
    tokio::spawn(async move {
        if let Err(err) = desktop.start().await {
            warn!(error = %err, "desktop stack did not come up");
        }
    });
}

fn init_logs(cfg: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_env(config::LOG_LEVEL_ENV)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);

    let file_layer = open_log_file(&cfg.daemon_log_file_path).map(|file| {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_ansi(false)
            .with_writer(Arc::new(file))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();
}

fn open_log_file(path: &PathBuf) -> Option<std::fs::File> {
    if let Some(parent) = path.parent() {
        if std::fs::create_dir_all(parent).is_err() {
            eprintln!("failed to create log directory {}", parent.display());
            return None;
        }
    }
    match std::fs::OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => Some(file),
        Err(err) => {
            eprintln!("failed to open log file at {}: {err}", path.display());
            None
        }
    }
}
