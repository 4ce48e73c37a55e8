//! End-to-end reaping behavior. These tests install the real SIGCHLD reaper
//! and therefore run in their own test binary: a `waitpid(-1)` drain inside
//! a shared process would steal children belonging to unrelated tests.

use std::process::Command;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::time::Duration;

use nix::unistd::Pid;

use deck_core::execute::ExecuteRequest;
use deck_core::execute::execute;
use deck_core::reap::ProcessRegistry;
use deck_core::reap::install_reaper;

// The reaper is process-global; serialize the tests so two runtimes never
// drain each other's children.
fn serial() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(Mutex::default)
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reaper_collects_unwaited_children() {
    let _guard = serial();
    let registry = Arc::new(ProcessRegistry::default());
    install_reaper(Arc::clone(&registry)).expect("install reaper");

    let child = Command::new("/bin/sh")
        .arg("-c")
        .arg("exit 7")
        .spawn()
        .expect("spawn child");
    let pid = Pid::from_raw(child.id() as i32);
    registry.register(pid);

    let record = registry
        .wait_for_exit_status(pid, Duration::from_secs(5))
        .await
        .expect("reaper delivered the exit status");
    assert_eq!(record.exit_code(), 7);

    registry.unregister(pid);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn execute_survives_losing_the_wait_race() {
    let _guard = serial();
    let registry = Arc::new(ProcessRegistry::default());
    install_reaper(Arc::clone(&registry)).expect("install reaper");

    // With the reaper live, either the foreground wait or the reaper
    // collects each child; the reported exit code must be right either way.
    for _ in 0..10 {
        let response = execute(
            &registry,
            ExecuteRequest {
                command: "/bin/sh -c 'exit 7'".to_string(),
                cwd: None,
                timeout: None,
            },
        )
        .await
        .expect("execute");
        assert_eq!(response.exit_code, 7);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn signal_death_reports_unknown_exit_code() {
    let _guard = serial();
    let registry = Arc::new(ProcessRegistry::default());
    install_reaper(Arc::clone(&registry)).expect("install reaper");

    let child = Command::new("/bin/sh")
        .arg("-c")
        .arg("kill -KILL $$")
        .spawn()
        .expect("spawn child");
    let pid = Pid::from_raw(child.id() as i32);
    registry.register(pid);

    let record = registry
        .wait_for_exit_status(pid, Duration::from_secs(5))
        .await
        .expect("reaper delivered the exit status");
    assert_eq!(record.exit_code(), -1);

    registry.unregister(pid);
}
