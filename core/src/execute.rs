//! One-shot command execution.
//!
//! Commands run in their own process group so a timeout can take the whole
//! child tree down with one signal. The PID is registered with the reap
//! registry before the first `wait`, which closes the window where the PID-1
//! reaper collects the child first and the foreground `wait` comes back with
//! ECHILD.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::sys::signal::killpg;
use nix::unistd::Pid;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::debug;
use tracing::warn;

use crate::reap::ProcessRegistry;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(360);
const DEFAULT_ECHILD_WAIT: Duration = Duration::from_millis(200);
const FALLBACK_ECHILD_WAIT: Duration = Duration::from_secs(1);
const ECHILD_WAIT_ENV: &str = "DECK_EXECUTE_ECHILD_WAIT_MS";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub command: String,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Maximum run time in whole seconds. Zero or negative selects the
    /// default of 360 s.
    #[serde(default)]
    pub timeout: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    /// -1 means the status could not be determined (reaper won the race and
    /// the cache wait timed out); callers should treat it as "unknown".
    pub exit_code: i32,
    /// All of stdout followed by all of stderr, captured at completion.
    pub result: String,
}

#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("empty command")]
    EmptyCommand,
    #[error("command execution timeout")]
    Timeout,
    #[error("failed to start command: {error}")]
    Start {
        #[source]
        error: std::io::Error,
    },
}

/// Runs `request.command` to completion and reports `{exit_code, result}`.
pub async fn execute(
    registry: &Arc<ProcessRegistry>,
    request: ExecuteRequest,
) -> Result<ExecuteResponse, ExecuteError> {
    let argv = parse_command(&request.command);
    let Some((program, args)) = argv.split_first() else {
        return Err(ExecuteError::EmptyCommand);
    };

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // Group leader, so the timeout can kill the whole child tree.
        .process_group(0);
    if let Some(cwd) = &request.cwd {
        command.current_dir(cwd);
    }

    let mut child = command
        .spawn()
        .map_err(|error| ExecuteError::Start { error })?;
    let pid = Pid::from_raw(child.id().unwrap_or_default() as i32);
    debug!(pid = pid.as_raw(), command = %request.command, "started command");

    // Register before the first wait; the reaper may collect the child at
    // any point from here on.
    registry.register(pid);
    let _guard = RegistrationGuard {
        registry: Arc::clone(registry),
        pid,
    };

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_task = tokio::spawn(read_to_end(stdout));
    let stderr_task = tokio::spawn(read_to_end(stderr));

    let timeout = request
        .timeout
        .filter(|secs| *secs > 0)
        .map(|secs| Duration::from_secs(secs as u64))
        .unwrap_or(DEFAULT_TIMEOUT);

    let mut timed_out = false;
    let wait_result = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(result) => result,
        Err(_) => {
            timed_out = true;
            // Negative target takes down the whole process group.
            if let Err(err) = killpg(pid, Signal::SIGKILL) {
                warn!(pid = pid.as_raw(), error = %err, "failed to kill process group on timeout");
            }
            child.wait().await
        }
    };

    let mut result = stdout_task.await.unwrap_or_default();
    result.extend(stderr_task.await.unwrap_or_default());

    if timed_out {
        return Err(ExecuteError::Timeout);
    }

    let exit_code = match wait_result {
        Ok(status) => status.code().unwrap_or(-1),
        Err(err) if is_no_child_error(&err) => {
            exit_code_from_registry(registry, pid).await
        }
        Err(err) => {
            warn!(pid = pid.as_raw(), error = %err, "unexpected wait error");
            -1
        }
    };

    Ok(ExecuteResponse {
        exit_code,
        result: String::from_utf8_lossy(&result).into_owned(),
    })
}

struct RegistrationGuard {
    registry: Arc<ProcessRegistry>,
    pid: Pid,
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.registry.unregister(self.pid);
        debug!(pid = self.pid.as_raw(), "unregistered command pid");
    }
}

async fn read_to_end(reader: Option<impl tokio::io::AsyncRead + Unpin>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        let _ = reader.read_to_end(&mut buf).await;
    }
    buf
}

/// The reaper won the race: serve the cached status, waiting briefly for it
/// to land when the reaper has not gotten there yet.
async fn exit_code_from_registry(registry: &ProcessRegistry, pid: Pid) -> i32 {
    if let Some(record) = registry.cached_exit_status(pid) {
        debug!(pid = pid.as_raw(), code = record.exit_code(), "exit code from cache");
        return record.exit_code();
    }
    let wait = echild_wait_timeout();
    if let Some(record) = registry.wait_for_exit_status(pid, wait).await {
        debug!(
            pid = pid.as_raw(),
            code = record.exit_code(),
            wait_ms = wait.as_millis() as u64,
            "exit code from cache after wait"
        );
        return record.exit_code();
    }
    warn!(pid = pid.as_raw(), "child was reaped but no cached status found");
    -1
}

fn is_no_child_error(err: &std::io::Error) -> bool {
    if err.raw_os_error() == Some(libc::ECHILD) {
        return true;
    }
    err.to_string().contains("No child process")
}

fn echild_wait_timeout() -> Duration {
    let Ok(value) = std::env::var(ECHILD_WAIT_ENV) else {
        return DEFAULT_ECHILD_WAIT;
    };
    let value = value.trim();
    if value.is_empty() {
        return DEFAULT_ECHILD_WAIT;
    }
    match value.parse::<i64>() {
        Ok(ms) if ms >= 0 => Duration::from_millis(ms as u64),
        _ => FALLBACK_ECHILD_WAIT,
    }
}

/// Splits a command line into argv, honoring single and double quotes.
/// Space is the only separator; a mismatched closing quote is literal; no
/// shell expansion of any kind.
pub fn parse_command(command: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for ch in command.chars() {
        match ch {
            '"' | '\'' => match quote {
                None => quote = Some(ch),
                Some(open) if open == ch => quote = None,
                Some(_) => current.push(ch),
            },
            ' ' if quote.is_none() => {
                if !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(ch),
        }
    }

    if !current.is_empty() {
        args.push(current);
    }

    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<ProcessRegistry> {
        Arc::new(ProcessRegistry::default())
    }

    fn request(command: &str) -> ExecuteRequest {
        ExecuteRequest {
            command: command.to_string(),
            cwd: None,
            timeout: None,
        }
    }

    #[test]
    fn parse_splits_on_spaces() {
        assert_eq!(parse_command("a b"), vec!["a", "b"]);
    }

    #[test]
    fn parse_keeps_single_quoted_spaces() {
        assert_eq!(parse_command("'a b'"), vec!["a b"]);
    }

    #[test]
    fn parse_joins_quoted_and_bare_segments() {
        assert_eq!(parse_command("\"a b\"c"), vec!["a bc"]);
    }

    #[test]
    fn parse_empty_input_yields_no_args() {
        assert_eq!(parse_command(""), Vec::<String>::new());
        assert_eq!(parse_command(" "), Vec::<String>::new());
    }

    #[test]
    fn parse_mismatched_inner_quote_is_literal() {
        assert_eq!(parse_command("\"it's\""), vec!["it's"]);
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let err = execute(&registry(), request("  ")).await.unwrap_err();
        assert!(matches!(err, ExecuteError::EmptyCommand));
    }

    #[tokio::test]
    async fn captures_exit_code() {
        let response = execute(&registry(), request("/bin/sh -c 'exit 7'"))
            .await
            .expect("execute");
        assert_eq!(response.exit_code, 7);
    }

    #[tokio::test]
    async fn captures_stdout_then_stderr() {
        let response = execute(
            &registry(),
            request("/bin/sh -c 'echo out; echo err >&2'"),
        )
        .await
        .expect("execute");
        assert_eq!(response.exit_code, 0);
        assert_eq!(response.result, "out\nerr\n");
    }

    #[tokio::test]
    async fn respects_working_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut req = request("pwd");
        req.cwd = Some(dir.path().to_path_buf());
        let response = execute(&registry(), req).await.expect("execute");
        assert_eq!(response.exit_code, 0);
        assert!(response.result.trim_end().ends_with(
            dir.path().file_name().and_then(|n| n.to_str()).unwrap_or("")
        ));
    }

    #[tokio::test]
    async fn timeout_kills_the_process_group() {
        let mut req = request("/bin/sh -c 'sleep 5'");
        req.timeout = Some(1);
        let start = std::time::Instant::now();
        let err = execute(&registry(), req).await.unwrap_err();
        assert!(matches!(err, ExecuteError::Timeout));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn zero_timeout_selects_the_default() {
        let mut req = request("echo fast");
        req.timeout = Some(0);
        let response = execute(&registry(), req).await.expect("execute");
        assert_eq!(response.exit_code, 0);
    }
}
