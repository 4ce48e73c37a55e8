//! Non-PTY command execution over an SSH channel.

use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use nix::sys::signal::Signal;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use russh::ChannelId;
use russh::CryptoVec;
use russh::server::Handle;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::warn;

const SHELL: &str = "/bin/sh";
const READ_CHUNK_SIZE: usize = 8192;

pub(crate) struct ExecRequest {
    pub sid: String,
    /// `None` runs a bare shell, mirroring an exec request with no command.
    pub raw_command: Option<String>,
    pub work_dir: PathBuf,
    pub env: Vec<(String, String)>,
    pub input: mpsc::Receiver<Vec<u8>>,
    pub cancel: CancellationToken,
    pub child_pid: Arc<StdMutex<Option<Pid>>>,
}

/// Runs `/bin/sh [-c command]` wired to the SSH channel and reports the exit
/// status when it is done.
pub(crate) async fn run(request: ExecRequest, handle: Handle, channel: ChannelId) {
    let ExecRequest {
        sid,
        raw_command,
        work_dir,
        env,
        input,
        cancel,
        child_pid,
    } = request;

    let mut command = Command::new(SHELL);
    if let Some(raw) = &raw_command {
        command.arg("-c").arg(raw);
    }
    command
        .current_dir(&work_dir)
        .env("DECK_SESSION_ID", &sid)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in &env {
        command.env(key, value);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            error!(session = %sid, error = %err, "failed to start command");
            let _ = handle.exit_status_request(channel, 1).await;
            let _ = handle.close(channel).await;
            return;
        }
    };

    let pid = child.id().map(|pid| Pid::from_raw(pid as i32));
    if let Ok(mut slot) = child_pid.lock() {
        *slot = pid;
    }

    // Managed stdin copy: the pipe closes when the input side ends, so a
    // client that never sends EOF cannot leak this task's write end.
    let stdin = child.stdin.take();
    let stdin_task = tokio::spawn(async move {
        let Some(mut stdin) = stdin else { return };
        let mut input = input;
        while let Some(bytes) = input.recv().await {
            if stdin.write_all(&bytes).await.is_err() {
                break;
            }
        }
        let _ = stdin.shutdown().await;
    });

    let stdout_task = child.stdout.take().map(|stdout| {
        let handle = handle.clone();
        tokio::spawn(async move {
            relay(stdout, |chunk| {
                let handle = handle.clone();
                async move { handle.data(channel, CryptoVec::from_slice(&chunk)).await.is_ok() }
            })
            .await;
        })
    });
    let stderr_task = child.stderr.take().map(|stderr| {
        let handle = handle.clone();
        tokio::spawn(async move {
            relay(stderr, |chunk| {
                let handle = handle.clone();
                async move {
                    handle
                        .extended_data(channel, 1, CryptoVec::from_slice(&chunk))
                        .await
                        .is_ok()
                }
            })
            .await;
        })
    });

    // Watchdog: a disconnected client takes the child with it.
    let watchdog = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            cancel.cancelled().await;
            if let Some(pid) = pid {
                let _ = kill(pid, Signal::SIGKILL);
            }
        }
    });

    let wait_result = child.wait().await;
    watchdog.abort();
    stdin_task.abort();

    // Let the output relays drain before the exit status goes out.
    if let Some(task) = stdout_task {
        let _ = task.await;
    }
    if let Some(task) = stderr_task {
        let _ = task.await;
    }

    let exit_code = match wait_result {
        // Conventional 128 + signal for signal deaths.
        Ok(status) => status
            .code()
            .unwrap_or_else(|| status.signal().map(|sig| 128 + sig).unwrap_or(1))
            as u32,
        // The PID-1 reaper got there first; the session ends cleanly.
        Err(err) if is_already_reaped(&err) => {
            debug!(session = %sid, "command was reaped by the pid-1 supervisor");
            0
        }
        Err(err) => {
            warn!(session = %sid, error = %err, "command wait error");
            1
        }
    };

    let _ = handle.exit_status_request(channel, exit_code).await;
    let _ = handle.eof(channel).await;
    let _ = handle.close(channel).await;
}

async fn relay<R, F, Fut>(mut reader: R, mut send: F)
where
    R: tokio::io::AsyncRead + Unpin,
    F: FnMut(Vec<u8>) -> Fut,
    Fut: Future<Output = bool>,
{
    let mut buf = [0u8; READ_CHUNK_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if !send(buf[..n].to_vec()).await {
                    break;
                }
            }
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
