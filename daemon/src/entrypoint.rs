//! The optional container entrypoint command.
//!
//! Whatever arguments the daemon was started with become a child command
//! whose output is captured to the entrypoint log. Shutdown escalates in
//! three stages: wait, SIGTERM, SIGKILL, each with its own window.

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::Config;

pub struct EntrypointHandle {
    pid: Pid,
    done: watch::Receiver<bool>,
}

/// Starts the entrypoint command with stdout/stderr appended to the
/// entrypoint log (falling back to the daemon's own stdio when the log file
/// cannot be opened). Returns `None` when the command cannot start.
pub fn spawn(args: &[String], log_path: &Path) -> Option<EntrypointHandle> {
    let (program, rest) = args.split_first()?;

    let log_file = open_log(log_path);
    if log_file.is_none() {
        error!(path = %log_path.display(), "failed to open entrypoint log, falling back to stdio");
    }

    let mut command = Command::new(program);
    command.args(rest);
    match log_file {
        Some(file) => {
            match file.try_clone() {
                Ok(err_file) => command.stderr(std::process::Stdio::from(err_file)),
                Err(_) => command.stderr(std::process::Stdio::inherit()),
            };
            command.stdout(std::process::Stdio::from(file));
        }
        None => {
            command.stdout(std::process::Stdio::inherit());
            command.stderr(std::process::Stdio::inherit());
        }
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            report(log_path, &format!("failed to start command: {err}"));
            return None;
        }
    };
    let pid = Pid::from_raw(child.id().unwrap_or_default() as i32);
    info!(pid = pid.as_raw(), command = %program, "entrypoint command started");

    let (done_tx, done_rx) = watch::channel(false);
    let log_path = log_path.to_path_buf();
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) if status.success() => {
                report(&log_path, "Entrypoint command completed successfully");
            }
            Ok(status) => {
                report(&log_path, &format!("command exited with status: {status}"));
            }
            Err(err) => {
                report(&log_path, &format!("command exited with error: {err}"));
            }
        }
        let _ = done_tx.send(true);
    });

    Some(EntrypointHandle { pid, done: done_rx })
}

impl EntrypointHandle {
    /// Escalating shutdown: wait for natural completion, then SIGTERM, then
    /// SIGKILL. Every stage is bounded by the configured windows.
    pub async fn shutdown(mut self, config: &Config) {
        info!("waiting for entrypoint command to complete");
        if self
            .wait_done(config.entrypoint_shutdown_timeout)
            .await
        {
            info!("entrypoint command completed");
            return;
        }

        warn!("entrypoint command did not complete within timeout, sending SIGTERM");
        if let Err(err) = kill(self.pid, Signal::SIGTERM) {
            error!(error = %err, "failed to send SIGTERM to entrypoint command");
        }
        if self.wait_done(config.sigterm_shutdown_timeout).await {
            info!("entrypoint command terminated gracefully");
            return;
        }

        warn!("entrypoint command did not respond to SIGTERM, sending SIGKILL");
        if let Err(err) = kill(self.pid, Signal::SIGKILL) {
            error!(error = %err, "failed to kill entrypoint command");
        }
        let _ = self.done.wait_for(|done| *done).await;
        info!("entrypoint command killed");
    }

    async fn wait_done(&mut self, window: Duration) -> bool {
        tokio::time::timeout(window, self.done.wait_for(|done| *done))
            .await
            .is_ok()
    }
}

/// Prints the captured entrypoint log; the `entrypoint logs` subcommand.
pub fn print_logs(log_path: &Path) {
    match std::fs::read_to_string(log_path) {
        Ok(contents) => print!("{contents}"),
        Err(err) => eprintln!("failed to read entrypoint logs at {}: {err}", log_path.display()),
    }
}

fn open_log(path: &Path) -> Option<std::fs::File> {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .ok()
}

fn report(log_path: &Path, message: &str) {
    if let Some(mut file) = open_log(log_path) {
        let _ = writeln!(file, "{message}");
    } else {
        eprintln!("{message}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_timeouts(entrypoint: Duration, sigterm: Duration) -> Config {
        let mut config = Config::from_env();
        config.entrypoint_shutdown_timeout = entrypoint;
        config.sigterm_shutdown_timeout = sigterm;
        config
    }

    #[tokio::test]
    async fn completed_entrypoint_shuts_down_immediately() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = dir.path().join("entry.log");

        let handle = spawn(&["/bin/sh".into(), "-c".into(), "echo done".into()], &log)
            .expect("spawn entrypoint");
        tokio::time::sleep(Duration::from_millis(300)).await;

        let start = std::time::Instant::now();
        handle
            .shutdown(&config_with_timeouts(
                Duration::from_secs(5),
                Duration::from_secs(5),
            ))
            .await;
        assert!(start.elapsed() < Duration::from_secs(2));

        let contents = std::fs::read_to_string(&log).expect("log contents");
        assert!(contents.contains("done"));
        assert!(contents.contains("completed successfully"));
    }

    #[tokio::test]
    async fn stubborn_entrypoint_is_escalated_to_sigkill() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = dir.path().join("entry.log");

        // Ignores TERM, so only the KILL stage can end it.
        let handle = spawn(
            &[
                "/bin/sh".into(),
                "-c".into(),
                "trap '' TERM; sleep 30".into(),
            ],
            &log,
        )
        .expect("spawn entrypoint");
        tokio::time::sleep(Duration::from_millis(300)).await;

        let start = std::time::Instant::now();
        handle
            .shutdown(&config_with_timeouts(
                Duration::from_millis(300),
                Duration::from_millis(300),
            ))
            .await;
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn missing_binary_reports_and_returns_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = dir.path().join("entry.log");
        assert!(spawn(&["/nonexistent-entrypoint".into()], &log).is_none());
        let contents = std::fs::read_to_string(&log).expect("log contents");
        assert!(contents.contains("failed to start command"));
    }
}
