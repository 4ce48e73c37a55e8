//! PID-1 zombie reaping.
//!
//! The daemon is the init process of its container, so every orphaned child
//! in the sandbox gets re-parented to it and must be waited on or it leaks as
//! a zombie. The reaper drains all exited children on SIGCHLD and records
//! their statuses in the [`ProcessRegistry`], where foreground waiters pick
//! them up when their own `wait` loses the race.

mod registry;

use std::sync::Arc;

use nix::errno::Errno;
use nix::sys::wait::WaitPidFlag;
use nix::sys::wait::WaitStatus;
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use tokio::signal::unix::SignalKind;
use tokio::signal::unix::signal;
use tracing::debug;
use tracing::warn;

pub use registry::ExitRecord;
pub use registry::ProcessRegistry;

/// Installs the SIGCHLD-driven reaper. Must run before anything else spawns
/// children. The spawned task never exits and never panics; reaped statuses
/// flow into `registry`.
pub fn install_reaper(registry: Arc<ProcessRegistry>) -> std::io::Result<()> {
    let mut sigchld = signal(SignalKind::child())?;
    tokio::spawn(async move {
        // SIGCHLD coalesces, so each delivery drains every exited child.
        while sigchld.recv().await.is_some() {
            drain_exited(&registry);
        }
    });
    Ok(())
}

fn drain_exited(registry: &ProcessRegistry) {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => {
                let Some(pid) = status.pid() else {
                    break;
                };
                registry.cache_exit_status(pid, status);
                if registry.is_registered(pid) {
                    debug!(
                        pid = pid.as_raw(),
                        ?status,
                        "reaped child with a registered waiter, cached exit status"
                    );
                } else {
                    debug!(pid = pid.as_raw(), ?status, "reaped orphaned child");
                }
            }
            // No more children at all; the normal end of a drain pass.
            Err(Errno::ECHILD) => break,
            Err(Errno::EINTR) => continue,
            Err(err) => {
                warn!(error = %err, "waitpid failed while reaping");
                break;
            }
        }
    }
}

// Reaper behavior is covered by tests/reap_behavior.rs: a waitpid(-1) drain
// inside the shared unit-test process would steal children belonging to
// other tests.
