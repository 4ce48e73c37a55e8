use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::sys::signal::kill;
use nix::sys::signal::killpg;
use nix::unistd::Pid;
use nix::unistd::User;
use nix::unistd::getpgid;
use serde::Serialize;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::supervisor::FIXED_DBUS_ADDRESS;

const RESTART_DELAY: Duration = Duration::from_secs(2);

/// Immutable launch description for one supervised process.
#[derive(Debug, Clone)]
pub(crate) struct ProcessSpec {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    /// Target user; the child drops to this identity when the supervisor
    /// runs as root.
    pub user: String,
    /// Lower starts earlier; stop order is the reverse.
    pub priority: i32,
    pub env: Vec<(String, String)>,
    pub log_file: PathBuf,
    pub err_file: PathBuf,
    pub auto_restart: bool,
}

#[derive(Debug, Default)]
pub(crate) struct ProcessState {
    pub running: bool,
    pub pid: Option<Pid>,
    pub cancel: Option<CancellationToken>,
}

/// One supervised process: the spec plus the mutable runtime state guarded
/// by the record's own lock. At most one live OS process exists per record.
#[derive(Debug)]
pub(crate) struct ManagedProcess {
    pub spec: ProcessSpec,
    pub state: Mutex<ProcessState>,
}

/// Point-in-time view of one record, as reported over the status surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStatus {
    pub running: bool,
    pub priority: i32,
    pub auto_restart: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
}

impl ManagedProcess {
    pub fn new(spec: ProcessSpec) -> Arc<Self> {
        Arc::new(Self {
            spec,
            state: Mutex::new(ProcessState::default()),
        })
    }

    /// Snapshot for the status surface. Liveness is probed with the null
    /// signal so an exited-but-unobserved pid does not read as running.
    pub fn status(&self) -> ProcessStatus {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let live_pid = state.pid.filter(|pid| kill(*pid, None).is_ok());
        ProcessStatus {
            running: live_pid.is_some(),
            priority: self.spec.priority,
            auto_restart: self.spec.auto_restart,
            pid: live_pid.map(Pid::as_raw),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state
            .lock()
            .map(|state| state.running)
            .unwrap_or(false)
    }

    /// Kills the record's whole process group and stops its restart loop.
    /// SIGKILL with no TERM stage, matching the stack's teardown contract.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pid) = state.pid.take() {
            info!(process = %self.spec.name, pid = pid.as_raw(), "stopping process group");
            match getpgid(Some(pid)) {
                Ok(pgid) => {
                    let _ = killpg(pgid, Signal::SIGKILL);
                }
                Err(_) => {
                    let _ = kill(pid, Signal::SIGKILL);
                }
            }
        }
        if let Some(cancel) = state.cancel.take() {
            cancel.cancel();
        }
        state.running = false;
    }

    /// Runs the process under auto-restart until it is stopped or exits with
    /// restarts disabled. Spawned once per record; re-entry is a no-op while
    /// the previous loop is live.
    pub async fn run_loop(self: Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.running {
                return;
            }
            state.running = true;
        }

        loop {
            let cancel = CancellationToken::new();
            {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if !state.running {
                    break;
                }
                state.cancel = Some(cancel.clone());
            }

            info!(process = %self.spec.name, command = %self.spec.command, "starting process");
            match self.launch() {
                Ok(mut child) => {
                    {
                        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                        state.pid = child.id().map(|pid| Pid::from_raw(pid as i32));
                    }
                    let cancelled = tokio::select! {
                        status = child.wait() => {
                            info!(process = %self.spec.name, status = ?status.ok(), "process exited");
                            false
                        }
                        _ = cancel.cancelled() => true,
                    };
                    if cancelled {
                        // The group was already killed by stop(); this just
                        // reaps the direct child.
                        let _ = child.wait().await;
                    }
                }
                Err(err) => {
                    error!(process = %self.spec.name, error = %err, "failed to start process");
                }
            }

            {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                state.pid = None;
            }

            if !self.spec.auto_restart || cancel.is_cancelled() {
                break;
            }
            tokio::time::sleep(RESTART_DELAY).await;
        }

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.running = false;
        state.pid = None;
    }

    fn launch(&self) -> std::io::Result<tokio::process::Child> {
        let mut command = Command::new(&self.spec.command);
        command
            .args(&self.spec.args)
            .stdin(Stdio::null())
            // Own group so stop() can take down the whole child tree.
            .process_group(0);

        for (key, value) in &self.spec.env {
            command.env(key, value);
        }
        // The fixed session bus address wins over anything inherited.
        command.env("DBUS_SESSION_BUS_ADDRESS", FIXED_DBUS_ADDRESS);

        if nix::unistd::getuid().is_root() && !self.spec.user.is_empty() && self.spec.user != "root"
        {
            match User::from_name(&self.spec.user) {
                Ok(Some(user)) => {
                    info!(
                        process = %self.spec.name,
                        user = %self.spec.user,
                        uid = user.uid.as_raw(),
                        "dropping privileges for child"
                    );
                    command.uid(user.uid.as_raw()).gid(user.gid.as_raw());
                }
                _ => {
                    warn!(
                        process = %self.spec.name,
                        user = %self.spec.user,
                        "target user not found, child keeps root"
                    );
                }
            }
        }

        command.stdout(open_log(&self.spec.log_file)?);
        command.stderr(open_log(&self.spec.err_file)?);
        command.spawn()
    }
}

fn open_log(path: &PathBuf) -> std::io::Result<Stdio> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    Ok(Stdio::from(file))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, command: &str, args: &[&str], auto_restart: bool) -> ProcessSpec {
        let dir = std::env::temp_dir();
        ProcessSpec {
            name: name.to_string(),
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            user: String::new(),
            priority: 100,
            env: Vec::new(),
            log_file: dir.join(format!("{name}.log")),
            err_file: dir.join(format!("{name}.err")),
            auto_restart,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn one_shot_process_runs_and_clears_state() {
        let process = ManagedProcess::new(spec("oneshot", "/bin/sh", &["-c", "true"], false));
        let runner = Arc::clone(&process);
        tokio::time::timeout(Duration::from_secs(5), runner.run_loop())
            .await
            .expect("loop finished");

        assert!(!process.is_running());
        assert!(!process.status().running);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_terminates_a_long_running_process() {
        let process = ManagedProcess::new(spec("longrun", "/bin/sh", &["-c", "sleep 30"], true));
        let runner = Arc::clone(&process);
        let task = tokio::spawn(runner.run_loop());

        // Wait for the child to come up.
        for _ in 0..50 {
            if process.status().running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(process.status().running);
        let pid = process.status().pid.expect("live pid");

        process.stop();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("loop stopped")
            .expect("join");

        assert!(!process.is_running());
        assert!(kill(Pid::from_raw(pid), None).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_start_of_one_shot_does_not_stick() {
        let process = ManagedProcess::new(spec("missing", "/nonexistent-binary", &[], false));
        let runner = Arc::clone(&process);
        tokio::time::timeout(Duration::from_secs(5), runner.run_loop())
            .await
            .expect("loop finished");
        assert!(!process.is_running());
    }
}
