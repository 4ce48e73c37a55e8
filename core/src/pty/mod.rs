//! Interactive shell sessions in pseudo-terminals.
//!
//! One call to [`spawn_tty`] hosts exactly one shell for one client
//! connection: bytes flow between the PTY master and the caller's channels,
//! resize events land as PTY size changes, and a cancelled session is
//! escalated from SIGTERM to SIGKILL so the child never outlives its client.

mod shell;

use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use portable_pty::CommandBuilder;
use portable_pty::MasterPty;
use portable_pty::PtySize;
use portable_pty::native_pty_system;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

pub use shell::resolve_shell;

const INITIAL_ROWS: u16 = 24;
const INITIAL_COLS: u16 = 80;
const TERMINATE_GRACE: Duration = Duration::from_secs(2);
const READ_CHUNK_SIZE: usize = 8192;

/// A window-size update from the client, in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtySize {
    pub rows: u16,
    pub cols: u16,
}

/// Everything one PTY session needs from its transport. The byte channels
/// are the session's opaque stdin/stdout endpoints; the resize channel
/// should have capacity one with senders using `try_send` so a slow ioctl
/// never backs up the transport.
pub struct TtyOptions {
    /// Short hex id used only for log correlation.
    pub session_id: String,
    pub work_dir: Option<PathBuf>,
    /// Value for `TERM`, e.g. `xterm-256color`.
    pub term: String,
    /// Extra environment entries appended last, overriding inherited ones.
    pub env: Vec<(String, String)>,
    pub input: mpsc::Receiver<Vec<u8>>,
    pub output: mpsc::Sender<Vec<u8>>,
    pub resize: mpsc::Receiver<TtySize>,
    /// Cancelled when the client disconnects.
    pub cancel: CancellationToken,
}

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to open pty: {error}")]
    OpenPty {
        #[source]
        error: anyhow::Error,
    },
    #[error("failed to spawn shell {shell}: {error}")]
    SpawnShell {
        shell: String,
        #[source]
        error: anyhow::Error,
    },
}

/// Starts a login shell in a fresh PTY and relays I/O until the shell exits
/// or the client disconnects. On return the child has been killed if still
/// alive and waited on, either here or by the PID-1 reaper.
pub async fn spawn_tty(options: TtyOptions) -> Result<(), PtyError> {
    let TtyOptions {
        session_id,
        work_dir,
        term,
        env,
        input,
        output,
        resize,
        cancel,
    } = options;

    let shell = resolve_shell();
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: INITIAL_ROWS,
            cols: INITIAL_COLS,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|error| PtyError::OpenPty { error })?;

    let mut builder = CommandBuilder::new(&shell);
    builder.env_clear();
    builder.env("TERM", &term);
    for (key, value) in std::env::vars() {
        builder.env(key, value);
    }
    builder.env("SHELL", &shell);
    for (key, value) in &env {
        builder.env(key, value);
    }
    if let Some(dir) = &work_dir {
        builder.cwd(dir);
    }

    let mut child = pair
        .slave
        .spawn_command(builder)
        .map_err(|error| PtyError::SpawnShell {
            shell: shell.clone(),
            error,
        })?;
    drop(pair.slave);

    let child_pid = child.process_id().map(|pid| Pid::from_raw(pid as i32));
    let mut killer = child.clone_killer();
    info!(session = %session_id, shell = %shell, pid = ?child_pid.map(Pid::as_raw), "spawned shell in pty");

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|error| PtyError::OpenPty { error })?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|error| PtyError::OpenPty { error })?;

    // Multiple paths race to close the master (watchdog, normal return);
    // the Option makes the close idempotent.
    let master: Arc<StdMutex<Option<Box<dyn MasterPty + Send>>>> =
        Arc::new(StdMutex::new(Some(pair.master)));

    // Output relay: PTY master -> caller. Ends on shell exit (EOF/EIO) or
    // when the caller goes away.
    let output_task = tokio::task::spawn_blocking({
        let session_id = session_id.clone();
        move || relay_output(reader, output, &session_id)
    });

    // Input relay: caller -> PTY master. Errors here are silent; the output
    // side decides when the session is over.
    let writer = Arc::new(StdMutex::new(writer));
    let input_task = tokio::spawn({
        let writer = Arc::clone(&writer);
        async move {
            let mut input = input;
            while let Some(bytes) = input.recv().await {
                let writer = Arc::clone(&writer);
                let write_result = tokio::task::spawn_blocking(move || {
                    let Ok(mut guard) = writer.lock() else {
                        return Err(());
                    };
                    guard.write_all(&bytes).and_then(|_| guard.flush()).map_err(|_| ())
                })
                .await;
                if !matches!(write_result, Ok(Ok(()))) {
                    break;
                }
            }
        }
    });

    // Resize events; a failed ioctl is logged but never fatal.
    let resize_task = tokio::spawn({
        let master = Arc::clone(&master);
        let session_id = session_id.clone();
        async move {
            let mut resize = resize;
            while let Some(size) = resize.recv().await {
                let guard = master.lock();
                let Ok(guard) = guard else { break };
                let Some(master) = guard.as_ref() else { break };
                if let Err(err) = master.resize(PtySize {
                    rows: size.rows,
                    cols: size.cols,
                    pixel_width: 0,
                    pixel_height: 0,
                }) {
                    warn!(session = %session_id, error = %err, "pty resize failed");
                }
            }
        }
    });

    // Watchdog: client disconnect terminates the shell, gracefully first.
    let watchdog = tokio::spawn({
        let master = Arc::clone(&master);
        let session_id = session_id.clone();
        let cancel = cancel.clone();
        let mut killer = child.clone_killer();
        async move {
            cancel.cancelled().await;
            if let Some(pid) = child_pid {
                info!(session = %session_id, pid = pid.as_raw(), "client disconnected, terminating shell");
                let _ = kill(pid, Signal::SIGTERM);
            }
            tokio::time::sleep(TERMINATE_GRACE).await;
            let _ = killer.kill();
            // Unblocks the output relay if the shell ignored everything.
            close_master(&master);
        }
    });

    // The session is over when the output relay returns.
    let _ = output_task.await;

    watchdog.abort();
    resize_task.abort();
    input_task.abort();

    let _ = killer.kill();
    close_master(&master);

    // The PID-1 reaper may already have collected the shell; both "no child"
    // flavors are a normal end of session.
    let wait_result = tokio::task::spawn_blocking(move || child.wait()).await;
    match wait_result {
        Ok(Ok(status)) => {
            debug!(session = %session_id, ?status, "shell reaped");
        }
        Ok(Err(err)) if is_already_reaped(&err) => {
            debug!(session = %session_id, "shell was reaped by the pid-1 supervisor");
        }
        Ok(Err(err)) => {
            warn!(session = %session_id, error = %err, "wait for shell failed");
        }
        Err(err) => {
            warn!(session = %session_id, error = %err, "wait task failed");
        }
    }

    Ok(())
}

fn relay_output(mut reader: Box<dyn Read + Send>, output: mpsc::Sender<Vec<u8>>, session_id: &str) {
    let mut buf = [0u8; READ_CHUNK_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if output.blocking_send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
            // On Linux the master reads EIO once the slave side is gone;
            // that is the shell exiting, not a failure.
            Err(err) => {
                if err.raw_os_error() != Some(libc::EIO) {
                    debug!(session = %session_id, error = %err, "pty output relay ended");
                }
                break;
            }
        }
    }
}

fn close_master(master: &Arc<StdMutex<Option<Box<dyn MasterPty + Send>>>>) {
    if let Ok(mut guard) = master.lock() {
        if let Some(master) = guard.take() {
            drop(master);
        }
    }
}

fn is_already_reaped(err: &std::io::Error) -> bool {
    if err.raw_os_error() == Some(libc::ECHILD) {
        return true;
    }
    let message = err.to_string();
    message.contains("No child process") || message.contains("already been waited")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(
        input: mpsc::Receiver<Vec<u8>>,
        output: mpsc::Sender<Vec<u8>>,
        resize: mpsc::Receiver<TtySize>,
        cancel: CancellationToken,
    ) -> TtyOptions {
        TtyOptions {
            session_id: "test0001".to_string(),
            work_dir: None,
            term: "xterm-256color".to_string(),
            env: Vec::new(),
            input,
            output,
            resize,
            cancel,
        }
    }

    async fn collect_until_exit(
        output: &mut mpsc::Receiver<Vec<u8>>,
        deadline: Duration,
    ) -> String {
        let mut collected = Vec::new();
        let _ = tokio::time::timeout(deadline, async {
            while let Some(chunk) = output.recv().await {
                collected.extend_from_slice(&chunk);
            }
        })
        .await;
        String::from_utf8_lossy(&collected).into_owned()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shell_runs_commands_and_exits() {
        let (input_tx, input_rx) = mpsc::channel(16);
        let (output_tx, mut output_rx) = mpsc::channel(64);
        let (_resize_tx, resize_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let session = tokio::spawn(spawn_tty(options(
            input_rx,
            output_tx,
            resize_rx,
            cancel.clone(),
        )));

        input_tx
            .send(b"echo pty-roundtrip-marker; exit\n".to_vec())
            .await
            .expect("send input");

        let transcript = collect_until_exit(&mut output_rx, Duration::from_secs(10)).await;
        assert!(
            transcript.contains("pty-roundtrip-marker"),
            "transcript: {transcript}"
        );

        let result = tokio::time::timeout(Duration::from_secs(10), session)
            .await
            .expect("session finished")
            .expect("join");
        assert!(result.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn disconnect_terminates_the_shell() {
        let (_input_tx, input_rx) = mpsc::channel(16);
        let (output_tx, mut output_rx) = mpsc::channel(64);
        let (_resize_tx, resize_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let session = tokio::spawn(spawn_tty(options(
            input_rx,
            output_tx,
            resize_rx,
            cancel.clone(),
        )));

        // Let the shell come up, then drop the client.
        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();

        let _ = collect_until_exit(&mut output_rx, Duration::from_secs(10)).await;
        let result = tokio::time::timeout(Duration::from_secs(10), session)
            .await
            .expect("session finished after disconnect")
            .expect("join");
        assert!(result.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn resize_is_visible_to_the_shell() {
        let (input_tx, input_rx) = mpsc::channel(16);
        let (output_tx, mut output_rx) = mpsc::channel(64);
        let (resize_tx, resize_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let session = tokio::spawn(spawn_tty(options(
            input_rx,
            output_tx,
            resize_rx,
            cancel.clone(),
        )));

        tokio::time::sleep(Duration::from_millis(300)).await;
        let _ = resize_tx.try_send(TtySize { rows: 40, cols: 120 });
        tokio::time::sleep(Duration::from_millis(300)).await;
        input_tx
            .send(b"stty size; exit\n".to_vec())
            .await
            .expect("send input");

        let transcript = collect_until_exit(&mut output_rx, Duration::from_secs(10)).await;
        assert!(transcript.contains("40 120"), "transcript: {transcript}");

        let _ = tokio::time::timeout(Duration::from_secs(10), session).await;
    }
}
