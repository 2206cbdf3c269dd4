//! Socket path resolution.
//!
//! Priority:
//! 1. `--socket <path>` on the command line
//! 2. `HRUN_SOCKET` (ignored when empty)
//! 3. `/tmp/hrun.sock`

use std::env;
use std::path::PathBuf;

/// Environment variable that overrides the default socket path.
pub const SOCKET_ENV: &str = "HRUN_SOCKET";

/// Socket path used when nothing else is configured.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/hrun.sock";

/// Resolve the socket path, preferring an explicit command-line value.
pub fn get_socket_path(explicit: Option<PathBuf>) -> PathBuf {
    if let Some(path) = explicit {
        return path;
    }

    if let Ok(path) = env::var(SOCKET_ENV) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }

    PathBuf::from(DEFAULT_SOCKET_PATH)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Mutex;

    use crate::daemon::paths::{get_socket_path, DEFAULT_SOCKET_PATH, SOCKET_ENV};

    // Env var manipulation is inherently non-thread-safe, so tests must run serially.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    // Saves and restores env vars, holding the mutex for the test's duration.
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
        _lock: std::sync::MutexGuard<'static, ()>,
    }

    impl EnvGuard {
        fn new(var_names: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
            let vars = var_names
                .iter()
                .map(|name| (name.to_string(), std::env::var(name).ok()))
                .collect();
            Self { vars, _lock: lock }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (name, value) in &self.vars {
                // SAFETY: We hold ENV_MUTEX, so no other test thread is modifying env vars
                unsafe {
                    match value {
                        Some(v) => std::env::set_var(name, v),
                        None => std::env::remove_var(name),
                    }
                }
            }
        }
    }

    #[test]
    fn test_default_socket_path() {
        let _guard = EnvGuard::new(&[SOCKET_ENV]);
        // SAFETY: We hold ENV_MUTEX via _guard
        unsafe { std::env::remove_var(SOCKET_ENV) };

        assert_eq!(get_socket_path(None), PathBuf::from(DEFAULT_SOCKET_PATH));
    }

    #[test]
    fn test_env_override() {
        let _guard = EnvGuard::new(&[SOCKET_ENV]);
        // SAFETY: We hold ENV_MUTEX via _guard
        unsafe { std::env::set_var(SOCKET_ENV, "/run/hrun/custom.sock") };

        assert_eq!(
            get_socket_path(None),
            PathBuf::from("/run/hrun/custom.sock")
        );
    }

    #[test]
    fn test_env_ignores_empty() {
        let _guard = EnvGuard::new(&[SOCKET_ENV]);
        // SAFETY: We hold ENV_MUTEX via _guard
        unsafe { std::env::set_var(SOCKET_ENV, "") };

        assert_eq!(get_socket_path(None), PathBuf::from(DEFAULT_SOCKET_PATH));
    }

    #[test]
    fn test_explicit_path_wins() {
        let _guard = EnvGuard::new(&[SOCKET_ENV]);
        // SAFETY: We hold ENV_MUTEX via _guard
        unsafe { std::env::set_var(SOCKET_ENV, "/run/hrun/custom.sock") };

        assert_eq!(
            get_socket_path(Some(PathBuf::from("/tmp/other.sock"))),
            PathBuf::from("/tmp/other.sock")
        );
    }
}
