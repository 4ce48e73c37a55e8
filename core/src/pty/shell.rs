use std::os::unix::fs::PermissionsExt;
use std::path::Path;

const PREFERRED_SHELL_PATHS: &[&str] = &[
    "/usr/bin/zsh",
    "/bin/zsh",
    "/usr/local/bin/zsh",
    "/opt/homebrew/bin/zsh",
];

const FALLBACK_SHELL_PATHS: &[&str] = &["/usr/bin/bash", "/bin/bash", "/bin/sh"];

const SHELLS_FILE: &str = "/etc/shells";

/// Picks the shell for a new PTY session. Preference order: the zsh install
/// locations, `$SHELL`, `/etc/shells` entries (preferred paths first, then
/// bash/sh, then anything executable), the bash/sh fallbacks, and finally a
/// bare `sh` left to PATH lookup.
pub fn resolve_shell() -> String {
    resolve_shell_from(
        PREFERRED_SHELL_PATHS,
        FALLBACK_SHELL_PATHS,
        Path::new(SHELLS_FILE),
        std::env::var("SHELL").ok(),
    )
}

fn resolve_shell_from(
    preferred: &[&str],
    fallback: &[&str],
    shells_file: &Path,
    shell_env: Option<String>,
) -> String {
    for path in preferred {
        if is_executable(Path::new(path)) {
            return (*path).to_string();
        }
    }

    if let Some(shell) = shell_env {
        if !shell.is_empty() && is_executable(Path::new(&shell)) {
            return shell;
        }
    }

    let shells = read_shells_file(shells_file);
    if !shells.is_empty() {
        for path in preferred {
            if shells.iter().any(|s| s == path) && is_executable(Path::new(path)) {
                return (*path).to_string();
            }
        }
        for path in fallback {
            if shells.iter().any(|s| s == path) && is_executable(Path::new(path)) {
                return (*path).to_string();
            }
        }
        for path in &shells {
            if is_executable(Path::new(path)) {
                return path.clone();
            }
        }
    }

    for path in fallback {
        if is_executable(Path::new(path)) {
            return (*path).to_string();
        }
    }

    "sh".to_string()
}

fn read_shells_file(path: &Path) -> Vec<String> {
    let Ok(data) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    data.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    !metadata.is_dir() && metadata.permissions().mode() & 0o111 != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;

    fn write_executable(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, "#!/bin/sh\n").expect("write shell stub");
        let mut perms = std::fs::metadata(&path).expect("metadata").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).expect("set permissions");
        path
    }

    #[test]
    fn prefers_the_zsh_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let zsh = write_executable(dir.path(), "zsh");
        let zsh_str = zsh.to_str().expect("utf-8 path");

        let shell = resolve_shell_from(&[zsh_str], &[], Path::new("/nonexistent"), None);
        assert_eq!(shell, zsh_str);
    }

    #[test]
    fn falls_back_to_shell_env() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env_shell = write_executable(dir.path(), "envshell");
        let env_str = env_shell.to_str().expect("utf-8 path").to_string();

        let shell = resolve_shell_from(&[], &[], Path::new("/nonexistent"), Some(env_str.clone()));
        assert_eq!(shell, env_str);
    }

    #[test]
    fn non_executable_shell_env_is_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let plain = dir.path().join("not-a-shell");
        std::fs::write(&plain, "data").expect("write file");

        let shell = resolve_shell_from(
            &[],
            &[],
            Path::new("/nonexistent"),
            Some(plain.to_str().expect("utf-8 path").to_string()),
        );
        assert_eq!(shell, "sh");
    }

    #[test]
    fn shells_file_entries_honor_the_preference_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let zsh = write_executable(dir.path(), "zsh");
        let bash = write_executable(dir.path(), "bash");
        let zsh_str = zsh.to_str().expect("utf-8 path");
        let bash_str = bash.to_str().expect("utf-8 path");

        let shells_file = dir.path().join("shells");
        std::fs::write(
            &shells_file,
            format!("# comment\n\n{bash_str}\n{zsh_str}\n"),
        )
        .expect("write shells file");

        // Preferred wins even though bash is listed first.
        let shell = resolve_shell_from(&[zsh_str], &[bash_str], &shells_file, None);
        assert_eq!(shell, zsh_str);
    }

    #[test]
    fn first_executable_shells_entry_wins_without_known_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        let other = write_executable(dir.path(), "fish");
        let other_str = other.to_str().expect("utf-8 path");

        let shells_file = dir.path().join("shells");
        std::fs::write(&shells_file, format!("{other_str}\n")).expect("write shells file");

        let shell = resolve_shell_from(&[], &[], &shells_file, None);
        assert_eq!(shell, other_str);
    }

    #[test]
    fn fallback_list_is_used_when_shells_file_is_unreadable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bash = write_executable(dir.path(), "bash");
        let bash_str = bash.to_str().expect("utf-8 path");

        let shell = resolve_shell_from(&[], &[bash_str], Path::new("/nonexistent"), None);
        assert_eq!(shell, bash_str);
    }

    #[test]
    fn last_resort_is_a_bare_sh() {
        let shell = resolve_shell_from(&[], &[], Path::new("/nonexistent"), None);
        assert_eq!(shell, "sh");
    }
}
