use std::time::Duration;

use tracing::info;
use tracing::warn;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5 * 60);

// Typical container FD limit is 1024; 800 leaves room to act before exec
// and accept start failing.
const FD_WARN_THRESHOLD: usize = 800;

/// Periodically logs open-FD counts so slow leaks show up in the logs long
/// before the daemon hits its rlimit.
pub fn spawn_heartbeat(version: &'static str) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await;
        loop {
            interval.tick().await;
            let fd_count = open_fd_count();
            info!(open_fds = fd_count, version, "heartbeat");
            if fd_count > FD_WARN_THRESHOLD {
                warn!(open_fds = fd_count, "high fd count, possible resource leak");
            }
        }
    });
}

fn open_fd_count() -> usize {
    std::fs::read_dir("/proc/self/fd")
        .map(|entries| entries.count())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fd_count_is_nonzero_on_linux() {
        // stdin/stdout/stderr alone guarantee a handful.
        assert!(open_fd_count() > 0);
    }
}
