use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;
use std::time::Instant;

use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use tokio::sync::Mutex as TokioMutex;
use tokio::sync::mpsc;

const EXIT_CACHE_TTL: Duration = Duration::from_secs(30);

/// Exit information for a reaped child, stamped when the reaper collected it.
#[derive(Debug, Clone, Copy)]
pub struct ExitRecord {
    pub status: WaitStatus,
    pub cached_at: Instant,
}

impl ExitRecord {
    /// Exit code the way shell-facing callers expect it: the code for a
    /// normal exit, -1 for a signal death.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            WaitStatus::Exited(_, code) => code,
            _ => -1,
        }
    }
}

/// Single-slot rendezvous between the reaper and the one caller waiting on a
/// PID. Capacity is exactly one so a late reaper never blocks on delivery.
#[derive(Debug, Clone)]
struct Waiter {
    tx: mpsc::Sender<ExitRecord>,
    rx: Arc<TokioMutex<mpsc::Receiver<ExitRecord>>>,
}

impl Waiter {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            tx,
            rx: Arc::new(TokioMutex::new(rx)),
        }
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    registered: HashSet<Pid>,
    exit_cache: HashMap<Pid, ExitRecord>,
    waiters: HashMap<Pid, Waiter>,
}

/// Tracks PIDs that are being actively waited on by foreground code and
/// caches exit statuses for children collected by the zombie reaper.
///
/// The owning caller registers its PID before spawning, so any interleaving
/// of reaper and owner still yields the real exit status to the owner.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    state: RwLock<RegistryState>,
}

impl ProcessRegistry {
    /// Declares that a caller intends to synchronously wait on `pid`.
    /// Idempotent; an existing rendezvous slot is kept.
    pub fn register(&self, pid: Pid) {
        let Ok(mut state) = self.state.write() else {
            return;
        };
        state.registered.insert(pid);
        state.waiters.entry(pid).or_insert_with(Waiter::new);
    }

    /// Removes a PID from the active wait list, dropping its rendezvous and
    /// any cached status. A no-op for PIDs that were never registered.
    pub fn unregister(&self, pid: Pid) {
        let Ok(mut state) = self.state.write() else {
            return;
        };
        state.registered.remove(&pid);
        state.waiters.remove(&pid);
        state.exit_cache.remove(&pid);
    }

    pub fn is_registered(&self, pid: Pid) -> bool {
        self.state
            .read()
            .map(|state| state.registered.contains(&pid))
            .unwrap_or(false)
    }

    /// Stores the exit status of a reaped child and hands it to the
    /// rendezvous slot if a waiter exists. Delivery is non-blocking; the
    /// registry lock is released before the send.
    pub fn cache_exit_status(&self, pid: Pid, status: WaitStatus) {
        self.cache_exit_status_at(pid, status, Instant::now());
    }

    fn cache_exit_status_at(&self, pid: Pid, status: WaitStatus, now: Instant) {
        let record = ExitRecord {
            status,
            cached_at: now,
        };
        let waiter = {
            let Ok(mut state) = self.state.write() else {
                return;
            };
            prune_exit_cache(&mut state, now);
            state.exit_cache.insert(pid, record);
            state.waiters.get(&pid).map(|waiter| waiter.tx.clone())
        };
        if let Some(tx) = waiter {
            let _ = tx.try_send(record);
        }
    }

    /// Returns the cached exit status for `pid` if present and not yet aged
    /// out. Pruning happens on this read path too, which upgrades it to the
    /// write lock.
    pub fn cached_exit_status(&self, pid: Pid) -> Option<ExitRecord> {
        let Ok(mut state) = self.state.write() else {
            return None;
        };
        prune_exit_cache(&mut state, Instant::now());
        state.exit_cache.get(&pid).copied()
    }

    /// Waits up to `timeout` for the reaper to deliver an exit status for
    /// `pid`. Fast path serves the cache; the slow path blocks on the
    /// rendezvous slot.
    pub async fn wait_for_exit_status(&self, pid: Pid, timeout: Duration) -> Option<ExitRecord> {
        if timeout.is_zero() {
            return self.cached_exit_status(pid);
        }

        if let Some(record) = self.cached_exit_status(pid) {
            return Some(record);
        }

        let rx = {
            let state = self.state.read().ok()?;
            state.waiters.get(&pid).map(|waiter| Arc::clone(&waiter.rx))
        }?;

        let mut rx = rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }
}

fn prune_exit_cache(state: &mut RegistryState, now: Instant) {
    state
        .exit_cache
        .retain(|_, record| now.duration_since(record.cached_at) <= EXIT_CACHE_TTL);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exited(pid: i32, code: i32) -> WaitStatus {
        WaitStatus::Exited(Pid::from_raw(pid), code)
    }

    #[test]
    fn register_is_idempotent() {
        let registry = ProcessRegistry::default();
        let pid = Pid::from_raw(100);
        registry.register(pid);
        registry.register(pid);
        assert!(registry.is_registered(pid));
    }

    #[test]
    fn unregister_without_register_is_noop() {
        let registry = ProcessRegistry::default();
        registry.unregister(Pid::from_raw(100));
        assert!(!registry.is_registered(Pid::from_raw(100)));
    }

    #[test]
    fn unregister_drops_cached_status() {
        let registry = ProcessRegistry::default();
        let pid = Pid::from_raw(100);
        registry.register(pid);
        registry.cache_exit_status(pid, exited(100, 3));
        registry.unregister(pid);
        assert!(registry.cached_exit_status(pid).is_none());
        assert!(!registry.is_registered(pid));
    }

    #[test]
    fn second_cache_event_overwrites_the_first() {
        let registry = ProcessRegistry::default();
        let pid = Pid::from_raw(100);
        registry.register(pid);
        registry.cache_exit_status(pid, exited(100, 1));
        registry.cache_exit_status(pid, exited(100, 2));

        let cached = registry.cached_exit_status(pid).expect("cached status");
        assert_eq!(cached.exit_code(), 2);
    }

    #[test]
    fn signal_death_maps_to_minus_one() {
        let record = ExitRecord {
            status: WaitStatus::Signaled(Pid::from_raw(100), nix::sys::signal::Signal::SIGKILL, false),
            cached_at: Instant::now(),
        };
        assert_eq!(record.exit_code(), -1);
    }

    #[test]
    fn stale_entries_are_pruned_on_read() {
        let registry = ProcessRegistry::default();
        let pid = Pid::from_raw(100);
        let stale = Instant::now() - EXIT_CACHE_TTL - Duration::from_secs(1);
        registry.cache_exit_status_at(pid, exited(100, 0), stale);
        assert!(registry.cached_exit_status(pid).is_none());
    }

    #[tokio::test]
    async fn wait_serves_the_cache_without_blocking() {
        let registry = ProcessRegistry::default();
        let pid = Pid::from_raw(200);
        registry.register(pid);
        registry.cache_exit_status(pid, exited(200, 7));

        let record = registry
            .wait_for_exit_status(pid, Duration::from_millis(200))
            .await
            .expect("cached status");
        assert_eq!(record.exit_code(), 7);
    }

    #[tokio::test]
    async fn wait_rendezvous_delivers_late_status() {
        let registry = Arc::new(ProcessRegistry::default());
        let pid = Pid::from_raw(300);
        registry.register(pid);

        let waiter = Arc::clone(&registry);
        let task = tokio::spawn(async move {
            waiter
                .wait_for_exit_status(pid, Duration::from_secs(2))
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        registry.cache_exit_status(pid, exited(300, 9));

        let record = task.await.expect("join").expect("delivered status");
        assert_eq!(record.exit_code(), 9);
    }

    #[tokio::test]
    async fn wait_times_out_when_nothing_is_delivered() {
        let registry = ProcessRegistry::default();
        let pid = Pid::from_raw(400);
        registry.register(pid);

        let record = registry
            .wait_for_exit_status(pid, Duration::from_millis(50))
            .await;
        assert!(record.is_none());
    }

    #[tokio::test]
    async fn wait_without_registration_misses() {
        let registry = ProcessRegistry::default();
        let record = registry
            .wait_for_exit_status(Pid::from_raw(500), Duration::from_millis(50))
            .await;
        assert!(record.is_none());
    }
}
