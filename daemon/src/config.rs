use std::path::PathBuf;
use std::time::Duration;

/// Shared token expected in [`AUTH_HEADER`] when set; empty disables auth.
pub const TOKEN_ENV: &str = "DECK_DAEMON_TOKEN";
pub const AUTH_HEADER: &str = "X-Deck-Token";
pub const LOG_LEVEL_ENV: &str = "DECK_LOG_LEVEL";

pub const TOOLBOX_PORT: u16 = 2280;
pub const SSH_PORT: u16 = 22220;
pub const TERMINAL_PORT: u16 = 22222;

const DAEMON_LOG_ENV: &str = "DECK_DAEMON_LOG_FILE_PATH";
const ENTRYPOINT_LOG_ENV: &str = "DECK_ENTRYPOINT_LOG_FILE_PATH";
const ENTRYPOINT_TIMEOUT_ENV: &str = "ENTRYPOINT_SHUTDOWN_TIMEOUT_SEC";
const SIGTERM_TIMEOUT_ENV: &str = "SIGTERM_SHUTDOWN_TIMEOUT_SEC";
const HOME_WORKDIR_ENV: &str = "DECK_USER_HOME_AS_WORKDIR";

const DEFAULT_ENTRYPOINT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_SIGTERM_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct Config {
    pub daemon_log_file_path: PathBuf,
    pub entrypoint_log_file_path: PathBuf,
    pub entrypoint_shutdown_timeout: Duration,
    pub sigterm_shutdown_timeout: Duration,
    pub user_home_as_workdir: bool,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            daemon_log_file_path: env_path(DAEMON_LOG_ENV)
                .unwrap_or_else(|| default_log_file("deck-daemon.log")),
            entrypoint_log_file_path: env_path(ENTRYPOINT_LOG_ENV)
                .unwrap_or_else(|| default_log_file("deck-entrypoint.log")),
            entrypoint_shutdown_timeout: env_timeout(
                ENTRYPOINT_TIMEOUT_ENV,
                DEFAULT_ENTRYPOINT_TIMEOUT,
            ),
            sigterm_shutdown_timeout: env_timeout(SIGTERM_TIMEOUT_ENV, DEFAULT_SIGTERM_TIMEOUT),
            user_home_as_workdir: env_bool(HOME_WORKDIR_ENV),
        }
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

/// Unset, unparsable, zero and negative values all select the default.
fn env_timeout(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<i64>().ok())
        .filter(|secs| *secs > 0)
        .map(|secs| Duration::from_secs(secs as u64))
        .unwrap_or(default)
}

fn env_bool(key: &str) -> bool {
    std::env::var(key)
        .map(|value| matches!(value.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

fn default_log_file(file_name: &str) -> PathBuf {
    default_log_dir().join(file_name)
}

fn default_log_dir() -> PathBuf {
    if cfg!(target_os = "macos") {
        if let Some(home) = dirs::home_dir() {
            return home.join("Library").join("Logs").join("deck");
        }
    }

    if cfg!(target_os = "linux") {
        if let Ok(state_home) = std::env::var("XDG_STATE_HOME") {
            if !state_home.is_empty() {
                return PathBuf::from(state_home).join("deck").join("logs");
            }
        }
        if let Some(home) = dirs::home_dir() {
            return home
                .join(".local")
                .join("state")
                .join("deck")
                .join("logs");
        }
    }

    if let Some(cache) = dirs::cache_dir() {
        return cache.join("deck").join("logs");
    }
    std::env::temp_dir()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_reject_non_positive_values() {
        assert_eq!(
            env_timeout("DECK_TEST_UNSET_TIMEOUT", DEFAULT_SIGTERM_TIMEOUT),
            DEFAULT_SIGTERM_TIMEOUT
        );
    }

    #[test]
    fn default_log_paths_are_absolute() {
        let config = Config::from_env();
        assert!(config.daemon_log_file_path.is_absolute());
        assert!(config.entrypoint_log_file_path.is_absolute());
        assert!(config.entrypoint_shutdown_timeout > Duration::ZERO);
        assert!(config.sigterm_shutdown_timeout > Duration::ZERO);
    }
}
