use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::signal::unix::SignalKind;
use tokio::signal::unix::signal;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::process::ManagedProcess;
use crate::process::ProcessSpec;
use crate::process::ProcessStatus;

pub(crate) const FIXED_DBUS_ADDRESS: &str = "unix:path=/var/run/dbus/user_bus_socket";
const DBUS_SOCKET_PATH: &str = "/var/run/dbus/user_bus_socket";
const DBUS_RUN_DIR: &str = "/var/run/dbus";
const DBUS_SOCKET_POLLS: u32 = 20;
const DBUS_SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(100);

const LAUNCH_STAGGER: Duration = Duration::from_secs(2);
const RESTART_PAUSE: Duration = Duration::from_secs(1);
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(8);

/// The records that must be live for the stack to count as `active`.
const REQUIRED_PROCESSES: &[&str] = &["xvfb", "xfce4", "x11vnc", "novnc"];

const DEFAULT_RESOLUTION: &str = "1280x720";
const DEFAULT_VNC_PORT: &str = "5901";
const DEFAULT_NOVNC_PORT: &str = "6080";
const DEFAULT_DISPLAY: &str = ":0";
const DEFAULT_USER: &str = "deck";

#[derive(Debug, Error)]
pub enum DesktopError {
    #[error("failed to determine home directory")]
    NoHomeDirectory,
    #[error("process {name} not found")]
    ProcessNotFound { name: String },
    #[error("no log file configured for process {name}")]
    NoLogFile { name: String },
    #[error("failed to read logs for {name}: {error}")]
    ReadLogs {
        name: String,
        #[source]
        error: std::io::Error,
    },
    #[error("failed to start: {names:?}")]
    RequiredNotRunning { names: Vec<String> },
    #[error("supervisor io error: {error}")]
    Io {
        #[source]
        #[from]
        error: std::io::Error,
    },
}

/// Aggregated health of the desktop stack, derived from the required set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemStatus {
    Active,
    Partial,
    Inactive,
    Error,
}

/// Owns the desktop process records. The supervisor-level lock guards only
/// the record map; each record carries its own lock for runtime state.
#[derive(Debug, Default)]
pub struct DesktopSupervisor {
    processes: RwLock<HashMap<String, Arc<ManagedProcess>>>,
    config_dir: RwLock<PathBuf>,
    initialized: AtomicBool,
}

impl DesktopSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepares the config directory, the session D-Bus daemon and the
    /// process records. Safe to call more than once; later calls are no-ops.
    pub async fn initialize(&self) -> Result<(), DesktopError> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let home = dirs::home_dir().ok_or(DesktopError::NoHomeDirectory)?;
        let config_dir = home.join(".deck").join("computeruse");
        std::fs::create_dir_all(&config_dir)?;
        if let Ok(mut dir) = self.config_dir.write() {
            *dir = config_dir.clone();
        }

        // Children of every subsystem must see the same session bus, so the
        // address is pinned process-wide rather than per-launch.
        unsafe {
            std::env::set_var("DBUS_SESSION_BUS_ADDRESS", FIXED_DBUS_ADDRESS);
            std::env::set_var("DBUS_SYSTEM_BUS_ADDRESS", FIXED_DBUS_ADDRESS);
        }

        let _ = std::fs::create_dir_all(DBUS_RUN_DIR);
        if nix::unistd::getuid().is_root() {
            if let Ok(Some(user)) = nix::unistd::User::from_name(&target_user()) {
                let _ = nix::unistd::chown(
                    Path::new(DBUS_RUN_DIR),
                    Some(user.uid),
                    Some(user.gid),
                );
            }
        }

        tokio::spawn(async {
            info!("starting session dbus-daemon");
            let status = tokio::process::Command::new("dbus-daemon")
                .arg("--session")
                .arg(format!("--address={FIXED_DBUS_ADDRESS}"))
                .arg("--nofork")
                .arg("--nopidfile")
                .status()
                .await;
            error!(status = ?status.ok(), "dbus-daemon exited");
        });

        for _ in 0..DBUS_SOCKET_POLLS {
            if Path::new(DBUS_SOCKET_PATH).exists() {
                info!("dbus socket is ready");
                break;
            }
            tokio::time::sleep(DBUS_SOCKET_POLL_INTERVAL).await;
        }

        self.populate_records(&home, &config_dir);
        Ok(())
    }

    /// Launches every record in priority order and verifies the required set
    /// came up.
    pub async fn start(&self) -> Result<(), DesktopError> {
        self.initialize().await?;

        let display_value = display_name();
        info!(display = %display_value, "starting desktop stack");

        let mut records = self.records();
        records.sort_by_key(|record| record.spec.priority);
        for record in records {
            // Each tier needs its predecessor up before X clients connect;
            // the stagger stands in for a readiness probe.
            tokio::spawn(Arc::clone(&record).run_loop());
            tokio::time::sleep(LAUNCH_STAGGER).await;
        }

        let status = self.process_status();
        let failed: Vec<String> = REQUIRED_PROCESSES
            .iter()
            .filter(|name| {
                !status
                    .get(**name)
                    .map(|status| status.running)
                    .unwrap_or(false)
            })
            .map(|name| (*name).to_string())
            .collect();

        if !failed.is_empty() {
            return Err(DesktopError::RequiredNotRunning { names: failed });
        }
        Ok(())
    }

    /// Stops every record in reverse priority order. SIGKILL by process
    /// group; there is no TERM stage for desktop processes.
    pub fn stop(&self) {
        info!("stopping all desktop processes");
        let mut records = self.records();
        records.sort_by_key(|record| std::cmp::Reverse(record.spec.priority));
        for record in records {
            record.stop();
        }
    }

    pub fn process_status(&self) -> HashMap<String, ProcessStatus> {
        let Ok(records) = self.processes.read() else {
            return HashMap::new();
        };
        records
            .iter()
            .map(|(name, record)| (name.clone(), record.status()))
            .collect()
    }

    pub fn is_process_running(&self, name: &str) -> Result<bool, DesktopError> {
        let record = self.record(name)?;
        Ok(record.is_running())
    }

    /// Stops the record, waits a moment for the group to die, and relaunches
    /// it asynchronously.
    pub async fn restart_process(&self, name: &str) -> Result<(), DesktopError> {
        let record = self.record(name)?;
        record.stop();
        tokio::time::sleep(RESTART_PAUSE).await;
        tokio::spawn(record.run_loop());
        Ok(())
    }

    pub fn process_logs(&self, name: &str) -> Result<String, DesktopError> {
        let record = self.record(name)?;
        read_whole_file(name, &record.spec.log_file)
    }

    pub fn process_errors(&self, name: &str) -> Result<String, DesktopError> {
        let record = self.record(name)?;
        read_whole_file(name, &record.spec.err_file)
    }

    /// `active` iff the whole required set is live, `partial` when anything
    /// at all is, `inactive` otherwise.
    pub fn system_status(&self) -> SystemStatus {
        if self.processes.read().is_err() {
            return SystemStatus::Error;
        }
        let status = self.process_status();
        aggregate_status(&status)
    }

    /// Installs the supervisor's own SIGTERM/SIGINT handler: stop the stack
    /// within a fixed budget, then exit.
    pub fn handle_system_signals(self: Arc<Self>) {
        tokio::spawn(async move {
            let Ok(mut sigterm) = signal(SignalKind::terminate()) else {
                return;
            };
            let Ok(mut sigint) = signal(SignalKind::interrupt()) else {
                return;
            };
            tokio::select! {
                _ = sigterm.recv() => {}
                _ = sigint.recv() => {}
            }
            info!("received shutdown signal, stopping desktop stack");

            let supervisor = Arc::clone(&self);
            let stopped = tokio::time::timeout(
                SHUTDOWN_BUDGET,
                tokio::task::spawn_blocking(move || supervisor.stop()),
            )
            .await;
            match stopped {
                Ok(_) => info!("desktop processes stopped"),
                Err(_) => warn!("desktop shutdown timed out, forcing exit"),
            }
            std::process::exit(0);
        });
    }

    pub(crate) fn config_dir(&self) -> PathBuf {
        self.config_dir
            .read()
            .map(|dir| dir.clone())
            .unwrap_or_default()
    }

    pub(crate) fn record(&self, name: &str) -> Result<Arc<ManagedProcess>, DesktopError> {
        let records = self
            .processes
            .read()
            .map_err(|_| DesktopError::ProcessNotFound {
                name: name.to_string(),
            })?;
        records
            .get(name)
            .cloned()
            .ok_or_else(|| DesktopError::ProcessNotFound {
                name: name.to_string(),
            })
    }

    pub(crate) fn insert_record(&self, record: Arc<ManagedProcess>) {
        if let Ok(mut records) = self.processes.write() {
            records.insert(record.spec.name.clone(), record);
        }
    }

    pub(crate) fn remove_record(&self, name: &str) -> Option<Arc<ManagedProcess>> {
        self.processes.write().ok()?.remove(name)
    }

    fn records(&self) -> Vec<Arc<ManagedProcess>> {
        self.processes
            .read()
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default()
    }

    fn populate_records(&self, home: &Path, config_dir: &Path) {
        let resolution = env_or("VNC_RESOLUTION", DEFAULT_RESOLUTION);
        let vnc_port = env_or("VNC_PORT", DEFAULT_VNC_PORT);
        let novnc_port = env_or("NO_VNC_PORT", DEFAULT_NOVNC_PORT);
        let display = display_name();
        let user = target_user();

        self.insert_record(ManagedProcess::new(ProcessSpec {
            name: "xvfb".to_string(),
            command: "/usr/bin/Xvfb".to_string(),
            args: vec![
                display.clone(),
                "-screen".to_string(),
                "0".to_string(),
                format!("{resolution}x24"),
            ],
            user: user.clone(),
            priority: 100,
            env: vec![("DISPLAY".to_string(), display.clone())],
            log_file: config_dir.join("xvfb.log"),
            err_file: config_dir.join("xvfb.err"),
            auto_restart: true,
        }));

        self.insert_record(ManagedProcess::new(ProcessSpec {
            name: "xfce4".to_string(),
            command: "/usr/bin/startxfce4".to_string(),
            args: Vec::new(),
            user: user.clone(),
            priority: 200,
            env: vec![
                ("DISPLAY".to_string(), display.clone()),
                ("HOME".to_string(), home.display().to_string()),
                ("USER".to_string(), user.clone()),
                ("XDG_RUNTIME_DIR".to_string(), format!("/tmp/runtime-{user}")),
            ],
            log_file: config_dir.join("xfce4.log"),
            err_file: config_dir.join("xfce4.err"),
            auto_restart: true,
        }));

        self.insert_record(ManagedProcess::new(ProcessSpec {
            name: "x11vnc".to_string(),
            command: "/usr/bin/x11vnc".to_string(),
            args: vec![
                "-display".to_string(),
                display.clone(),
                "-forever".to_string(),
                "-shared".to_string(),
                "-rfbport".to_string(),
                vnc_port.clone(),
            ],
            user: user.clone(),
            priority: 300,
            env: vec![("DISPLAY".to_string(), display.clone())],
            log_file: config_dir.join("x11vnc.log"),
            err_file: config_dir.join("x11vnc.err"),
            auto_restart: true,
        }));

        let (novnc_command, novnc_args) = novnc_launcher(&vnc_port, &novnc_port);
        self.insert_record(ManagedProcess::new(ProcessSpec {
            name: "novnc".to_string(),
            command: novnc_command,
            args: novnc_args,
            user,
            priority: 400,
            env: vec![("DISPLAY".to_string(), display)],
            log_file: config_dir.join("novnc.log"),
            err_file: config_dir.join("novnc.err"),
            auto_restart: true,
        }));
    }
}

pub(crate) fn aggregate_status(status: &HashMap<String, ProcessStatus>) -> SystemStatus {
    let all_required = REQUIRED_PROCESSES.iter().all(|name| {
        status
            .get(*name)
            .map(|status| status.running)
            .unwrap_or(false)
    });
    if all_required {
        return SystemStatus::Active;
    }
    if status.values().any(|status| status.running) {
        return SystemStatus::Partial;
    }
    SystemStatus::Inactive
}

/// Picks the best available noVNC entry point: the modern launcher script,
/// the legacy proxy script, or bare websockify.
fn novnc_launcher(vnc_port: &str, novnc_port: &str) -> (String, Vec<String>) {
    let launch = "/usr/share/novnc/utils/launch.sh";
    let proxy = "/usr/share/novnc/utils/novnc_proxy";
    if Path::new(launch).exists() {
        info!("using novnc launch.sh");
        (
            launch.to_string(),
            vec![
                "--vnc".to_string(),
                format!("localhost:{vnc_port}"),
                "--listen".to_string(),
                novnc_port.to_string(),
            ],
        )
    } else if Path::new(proxy).exists() {
        info!("using legacy novnc_proxy");
        (
            proxy.to_string(),
            vec![
                "--vnc".to_string(),
                format!("localhost:{vnc_port}"),
                "--listen".to_string(),
                novnc_port.to_string(),
            ],
        )
    } else {
        info!("using direct websockify fallback");
        (
            "websockify".to_string(),
            vec![
                "--web=/usr/share/novnc/".to_string(),
                novnc_port.to_string(),
                format!("localhost:{vnc_port}"),
            ],
        )
    }
}

pub(crate) fn target_user() -> String {
    std::env::var("VNC_USER")
        .ok()
        .filter(|user| !user.is_empty())
        .or_else(|| {
            std::env::var("DECK_SANDBOX_USER")
                .ok()
                .filter(|user| !user.is_empty())
        })
        .unwrap_or_else(|| DEFAULT_USER.to_string())
}

pub(crate) fn display_name() -> String {
    std::env::var("DISPLAY")
        .ok()
        .filter(|display| !display.is_empty())
        .unwrap_or_else(|| DEFAULT_DISPLAY.to_string())
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn read_whole_file(name: &str, path: &Path) -> Result<String, DesktopError> {
    if path.as_os_str().is_empty() {
        return Err(DesktopError::NoLogFile {
            name: name.to_string(),
        });
    }
    std::fs::read_to_string(path).map_err(|error| DesktopError::ReadLogs {
        name: name.to_string(),
        error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::process::ProcessSpec;

    fn stopped_record(name: &str, priority: i32) -> Arc<ManagedProcess> {
        ManagedProcess::new(ProcessSpec {
            name: name.to_string(),
            command: "/bin/true".to_string(),
            args: Vec::new(),
            user: String::new(),
            priority,
            env: Vec::new(),
            log_file: PathBuf::new(),
            err_file: PathBuf::new(),
            auto_restart: false,
        })
    }

    fn status(running: bool) -> ProcessStatus {
        ProcessStatus {
            running,
            priority: 100,
            auto_restart: true,
            pid: running.then_some(4242),
        }
    }

    #[test]
    fn all_required_running_is_active() {
        let map: HashMap<String, ProcessStatus> = REQUIRED_PROCESSES
            .iter()
            .map(|name| (name.to_string(), status(true)))
            .collect();
        assert_eq!(aggregate_status(&map), SystemStatus::Active);
    }

    #[test]
    fn some_running_is_partial() {
        let mut map: HashMap<String, ProcessStatus> = REQUIRED_PROCESSES
            .iter()
            .map(|name| (name.to_string(), status(false)))
            .collect();
        map.insert("x11vnc".to_string(), status(true));
        assert_eq!(aggregate_status(&map), SystemStatus::Partial);
    }

    #[test]
    fn nothing_running_is_inactive() {
        let map: HashMap<String, ProcessStatus> = REQUIRED_PROCESSES
            .iter()
            .map(|name| (name.to_string(), status(false)))
            .collect();
        assert_eq!(aggregate_status(&map), SystemStatus::Inactive);
        assert_eq!(aggregate_status(&HashMap::new()), SystemStatus::Inactive);
    }

    #[test]
    fn missing_required_record_is_partial_when_others_run() {
        let mut map = HashMap::new();
        map.insert("xvfb".to_string(), status(true));
        assert_eq!(aggregate_status(&map), SystemStatus::Partial);
    }

    #[test]
    fn unknown_process_lookups_fail() {
        let supervisor = DesktopSupervisor::new();
        assert!(matches!(
            supervisor.record("nope"),
            Err(DesktopError::ProcessNotFound { .. })
        ));
        assert!(supervisor.is_process_running("nope").is_err());
        assert!(supervisor.process_logs("nope").is_err());
    }

    #[test]
    fn fresh_supervisor_reports_inactive() {
        let supervisor = DesktopSupervisor::new();
        assert_eq!(supervisor.system_status(), SystemStatus::Inactive);
    }

    #[test]
    fn status_snapshot_reflects_inserted_records() {
        let supervisor = DesktopSupervisor::new();
        supervisor.insert_record(stopped_record("xvfb", 100));
        supervisor.insert_record(stopped_record("novnc", 400));

        let status = supervisor.process_status();
        assert_eq!(status.len(), 2);
        assert!(!status["xvfb"].running);
        assert_eq!(status["novnc"].priority, 400);
    }
}
