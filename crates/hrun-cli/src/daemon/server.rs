//! Unix socket listener that hands each connection to its own session.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use hrun_core::allow::AllowList;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::daemon::session::SessionHandler;
use crate::daemon::shutdown::ShutdownSignal;

/// How long to wait for in-flight sessions to tear down during shutdown.
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause after a failed accept before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// The server that accepts client connections.
pub struct Server {
    listener: UnixListener,
    socket_path: PathBuf,
    allow: Arc<AllowList>,
}

impl Server {
    /// Bind to `socket_path`.
    ///
    /// Uses a bind-first approach to avoid TOCTOU races:
    /// 1. Try to bind directly
    /// 2. If the path is taken, try connecting to it
    /// 3. If nothing answers, remove the stale socket and retry
    /// 4. If a server answers, return an error
    pub async fn bind(socket_path: PathBuf, allow: AllowList) -> Result<Self> {
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create socket directory for {:?}", socket_path)
            })?;
        }

        let listener = match UnixListener::bind(&socket_path) {
            Ok(l) => l,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                if UnixStream::connect(&socket_path).await.is_ok() {
                    anyhow::bail!("Server already running on {:?}", socket_path);
                }

                // Don't follow symlinks (could delete unintended files)
                let metadata = std::fs::symlink_metadata(&socket_path)
                    .with_context(|| format!("Failed to stat socket path: {:?}", socket_path))?;

                if metadata.file_type().is_symlink() {
                    anyhow::bail!(
                        "Socket path {:?} is a symlink, refusing to delete for safety",
                        socket_path
                    );
                }

                {
                    use std::os::unix::fs::FileTypeExt;
                    if !metadata.file_type().is_socket() {
                        anyhow::bail!(
                            "Path {:?} exists but is not a socket file (type: {:?})",
                            socket_path,
                            metadata.file_type()
                        );
                    }
                }

                info!("Removing stale socket {:?}", socket_path);
                std::fs::remove_file(&socket_path)
                    .with_context(|| format!("Failed to remove stale socket: {:?}", socket_path))?;

                UnixListener::bind(&socket_path)
                    .with_context(|| format!("Failed to bind to socket: {:?}", socket_path))?
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to bind to socket: {:?}", socket_path));
            }
        };

        if allow.is_restricted() {
            info!("Server listening on {:?} (allow-list active)", socket_path);
        } else {
            info!("Server listening on {:?}", socket_path);
        }

        Ok(Self {
            listener,
            socket_path,
            allow: Arc::new(allow),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept connections until `shutdown` fires.
    ///
    /// Every connection runs as its own task so sessions never block each
    /// other or the accept loop. Sessions react to `shutdown` on their own;
    /// once it fires this stops accepting and waits (bounded) for them to
    /// finish tearing down.
    pub async fn run(&self, shutdown: ShutdownSignal) -> Result<()> {
        let mut sessions: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let handler = SessionHandler::new(self.allow.clone(), shutdown.clone());
                            let id = handler.id().clone();
                            match stream.peer_cred() {
                                Ok(cred) => info!(
                                    "Session {}: accepted connection (pid {:?}, uid {})",
                                    id,
                                    cred.pid(),
                                    cred.uid()
                                ),
                                Err(_) => info!("Session {}: accepted connection", id),
                            }

                            sessions.spawn(async move {
                                match handler.run(stream).await {
                                    Ok(end) => info!("Session {}: closed, {}", id, end),
                                    Err(e) => warn!("Session {}: closed without running: {}", id, e),
                                }
                            });
                        }
                        Err(e) => back_off_after_accept_error(&e).await,
                    }
                }
                // Reap completed session tasks to prevent unbounded growth
                Some(result) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = result {
                        error!("Session task failed: {}", e);
                    }
                }
                _ = shutdown.wait() => {
                    info!("Shutdown signal received, no longer accepting connections");
                    break;
                }
            }
        }

        if !sessions.is_empty() {
            info!("Waiting for {} session(s) to close", sessions.len());

            let deadline = tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, async {
                while sessions.join_next().await.is_some() {}
            })
            .await;

            if deadline.is_err() {
                warn!(
                    "Sessions still open after {:?}, aborting {} of them",
                    GRACEFUL_SHUTDOWN_TIMEOUT,
                    sessions.len()
                );
                // Aborted sessions drop their PTY, which kills the child group.
                sessions.abort_all();
            }
        }

        debug!("Listener stopped");
        Ok(())
    }
}

/// Log a failed accept and pause before the next one.
///
/// Errors like EMFILE persist until some descriptor closes, so retrying at
/// once would spin.
async fn back_off_after_accept_error(e: &std::io::Error) {
    error!("Accept error: {}, retrying in {:?}", e, ACCEPT_ERROR_BACKOFF);
    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.socket_path.exists() && std::fs::remove_file(&self.socket_path).is_err() {
            warn!("Failed to remove socket on shutdown");
        }
    }
}
