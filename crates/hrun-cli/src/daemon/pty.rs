//! PTY ownership for one session, built on portable-pty.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hrun_core::error::SessionError;
use hrun_core::protocol::{CommandDescriptor, ResizeNotification};
use portable_pty::{
    native_pty_system, Child, CommandBuilder, ExitStatus, MasterPty, PtySize, SlavePty,
};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Terminal size in columns and rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TermSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl From<TermSize> for PtySize {
    fn from(size: TermSize) -> Self {
        PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

impl From<ResizeNotification> for TermSize {
    fn from(resize: ResizeNotification) -> Self {
        Self {
            cols: resize.width,
            rows: resize.height,
        }
    }
}

impl From<&CommandDescriptor> for TermSize {
    fn from(descriptor: &CommandDescriptor) -> Self {
        Self {
            cols: descriptor.width,
            rows: descriptor.height,
        }
    }
}

impl std::fmt::Display for TermSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

/// TERM given to children when the server itself has none.
const DEFAULT_TERM: &str = "xterm-256color";

/// A freshly allocated PTY pair with nothing attached yet.
pub struct PtyPair {
    master: Box<dyn MasterPty + Send>,
    slave: Box<dyn SlavePty + Send>,
    size: TermSize,
}

impl PtyPair {
    /// Allocate a PTY pair with the given initial geometry.
    pub fn open(size: TermSize) -> Result<Self, SessionError> {
        let pair = native_pty_system()
            .openpty(size.into())
            .map_err(|e| SessionError::PtyAllocation(format!("{:#}", e)))?;

        Ok(Self {
            master: pair.master,
            slave: pair.slave,
            size,
        })
    }

    /// Start `command` with stdin, stdout and stderr on the slave end.
    ///
    /// The child becomes a session leader with this PTY as its controlling
    /// terminal, so its pid is also its process group id. The slave handle is
    /// released once the child holds it, so the master sees EOF when the
    /// child side goes away.
    ///
    /// If the server itself dies without running its cleanup (SIGKILL, for
    /// instance), the child is only told through the SIGHUP the kernel sends
    /// its session when the master closes. A child that ignores SIGHUP, such
    /// as one started under `nohup`, keeps running.
    pub fn spawn(self, command: &[String]) -> Result<PtySession, SessionError> {
        let Some(program) = command.first() else {
            return Err(SessionError::spawn_failed(command, "command cannot be empty"));
        };

        let mut cmd = CommandBuilder::new(program);
        cmd.args(&command[1..]);
        if let Ok(cwd) = std::env::current_dir() {
            cmd.cwd(cwd);
        }
        if cmd.get_env("TERM").is_none() {
            cmd.env("TERM", DEFAULT_TERM);
        }

        let child = self
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::spawn_failed(command, format!("{:#}", e)))?;

        Ok(PtySession {
            master: self.master,
            child,
            size: self.size,
        })
    }
}

/// A PTY master with its child process attached.
pub struct PtySession {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    size: TermSize,
}

impl PtySession {
    fn reader(&self) -> Result<Box<dyn Read + Send>, SessionError> {
        self.master
            .try_clone_reader()
            .map_err(|e| SessionError::PtyAllocation(format!("failed to clone PTY reader: {:#}", e)))
    }

    fn writer(&self) -> Result<Box<dyn Write + Send>, SessionError> {
        self.master
            .take_writer()
            .map_err(|e| SessionError::PtyAllocation(format!("failed to take PTY writer: {:#}", e)))
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.process_id()
    }
}

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// How often `wait` polls the child for exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Async front for one PTY session.
///
/// Blocking PTY reads and writes happen on two background threads bridged to
/// tokio channels. All methods take `&self`, so the session's concurrent
/// activities can share one controller without extra wrapping.
pub struct PtyController {
    /// Sender for writing to PTY stdin.
    write_tx: mpsc::Sender<Vec<u8>>,
    /// Receiver for PTY output.
    read_rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    shutdown: Arc<AtomicBool>,
    /// Master PTY for resize operations (sends SIGWINCH).
    master: std::sync::Mutex<Box<dyn MasterPty + Send>>,
    child: std::sync::Mutex<Box<dyn Child + Send + Sync>>,
    pid: Option<u32>,
    /// Last successfully applied geometry.
    size: std::sync::Mutex<TermSize>,
    killed: AtomicBool,
}

impl PtyController {
    /// Start the I/O threads for a spawned PTY session.
    pub fn new(session: PtySession) -> Result<Self, SessionError> {
        let reader = session.reader()?;
        let writer = session.writer()?;
        let pid = session.pid();

        let shutdown = Arc::new(AtomicBool::new(false));
        let (write_tx, write_rx) = mpsc::channel::<Vec<u8>>(64);
        let (read_tx, read_rx) = mpsc::channel::<Vec<u8>>(64);

        let reader_shutdown = shutdown.clone();
        std::thread::Builder::new()
            .name("pty-reader".into())
            .spawn(move || Self::reader_loop(reader, read_tx, reader_shutdown))
            .map_err(|e| SessionError::PtyAllocation(format!("failed to start reader: {}", e)))?;

        std::thread::Builder::new()
            .name("pty-writer".into())
            .spawn(move || Self::writer_loop(writer, write_rx))
            .map_err(|e| SessionError::PtyAllocation(format!("failed to start writer: {}", e)))?;

        Ok(Self {
            write_tx,
            read_rx: tokio::sync::Mutex::new(read_rx),
            shutdown,
            master: std::sync::Mutex::new(session.master),
            child: std::sync::Mutex::new(session.child),
            pid,
            size: std::sync::Mutex::new(session.size),
            killed: AtomicBool::new(false),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Geometry most recently applied to the PTY.
    pub fn size(&self) -> TermSize {
        self.size.lock().map(|s| *s).unwrap_or_default()
    }

    /// Apply new geometry. Re-applying the current size is a no-op for the
    /// child; on failure the previous size stays in effect.
    pub fn resize(&self, size: TermSize) -> Result<(), SessionError> {
        let resize_error = |reason: String| SessionError::PtyResize {
            cols: size.cols,
            rows: size.rows,
            reason,
        };

        self.master
            .lock()
            .map_err(|_| resize_error("master PTY mutex poisoned".into()))?
            .resize(size.into())
            .map_err(|e| resize_error(format!("{:#}", e)))?;

        *self
            .size
            .lock()
            .map_err(|_| resize_error("size mutex poisoned".into()))? = size;
        Ok(())
    }

    /// Send bytes to the PTY input.
    pub async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        self.write_tx
            .send(data.to_vec())
            .await
            .map_err(|_| SessionError::Stream {
                direction: "socket -> pty",
                source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "PTY writer closed"),
            })
    }

    /// Receive the next chunk of PTY output, or `None` once the PTY closed.
    pub async fn read(&self) -> Option<Vec<u8>> {
        self.read_rx.lock().await.recv().await
    }

    /// Resolve once the child has exited, returning its status.
    pub async fn wait(&self) -> ExitStatus {
        let mut interval = tokio::time::interval(EXIT_POLL_INTERVAL);
        loop {
            interval.tick().await;
            let polled = match self.child.lock() {
                Ok(mut child) => child.try_wait(),
                Err(_) => {
                    error!("Child mutex poisoned, treating child as exited");
                    return ExitStatus::with_exit_code(1);
                }
            };
            match polled {
                Ok(Some(status)) => return status,
                Ok(None) => {}
                Err(e) => {
                    warn!("Failed to poll child status: {}", e);
                    return ExitStatus::with_exit_code(1);
                }
            }
        }
    }

    /// Kill the child's whole process group and stop the I/O threads.
    ///
    /// Safe to call more than once.
    pub fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Ok(mut child) = self.child.lock() {
            match self.pid {
                Some(pid) => kill_process_group(pid),
                None => {
                    if let Err(e) = child.kill() {
                        debug!("Failed to kill child (may have already exited): {}", e);
                    }
                }
            }
            // Reap to avoid zombies; the child just got SIGKILL.
            if let Err(e) = child.try_wait() {
                debug!("Failed to collect child exit status: {}", e);
            }
        }

        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Reader loop running in a background thread.
    fn reader_loop(
        mut reader: Box<dyn Read + Send>,
        read_tx: mpsc::Sender<Vec<u8>>,
        shutdown: Arc<AtomicBool>,
    ) {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            if shutdown.load(Ordering::SeqCst) {
                debug!("PTY reader shutdown");
                break;
            }

            match reader.read(&mut buf) {
                Ok(0) => {
                    debug!("PTY reader EOF");
                    break;
                }
                Ok(n) => {
                    if read_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        debug!("PTY read channel closed");
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    // EIO is how Linux reports that the slave side closed.
                    debug!("PTY read ended: {}", e);
                    break;
                }
            }
        }
    }

    /// Writer loop running in a background thread.
    fn writer_loop(mut writer: Box<dyn Write + Send>, mut write_rx: mpsc::Receiver<Vec<u8>>) {
        while let Some(data) = write_rx.blocking_recv() {
            if let Err(e) = writer.write_all(&data).and_then(|()| writer.flush()) {
                debug!("PTY write error: {}", e);
                break;
            }
        }
        debug!("PTY writer exiting");
    }
}

impl Drop for PtyController {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Send SIGKILL to every process in the group led by `pid`.
fn kill_process_group(pid: u32) {
    let Ok(pgid) = i32::try_from(pid) else {
        warn!("Child pid {} out of range, cannot signal its group", pid);
        return;
    };
    // SAFETY: kill(2) takes plain integers and has no memory-safety
    // preconditions. A negative pid addresses the process group.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        debug!(
            "Failed to kill process group {} (may have already exited): {}",
            pgid,
            std::io::Error::last_os_error()
        );
    }
}
