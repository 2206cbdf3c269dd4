//! Client side: connect, announce the command, then mirror the local
//! terminal over the socket.

use std::future::Future;
use std::path::Path;

use anyhow::Context;
use hrun_core::error::SessionError;
use hrun_core::protocol::{CommandDescriptor, ResizeNotification};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::daemon::pty::TermSize;
use crate::daemon::shutdown::unix_signal;
use crate::daemon::terminal::{self, RawModeGuard};

/// Buffer size for both copy directions.
const COPY_BUFFER_SIZE: usize = 4096;

/// Lifecycle of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connecting,
    SendingCommand,
    RawMode,
    Duplexing,
    Restoring,
    Done,
}

/// A connection to the server.
pub struct Client {
    stream: UnixStream,
    state: ClientState,
}

impl Client {
    /// Dial the server socket.
    pub async fn connect(socket_path: &Path) -> Result<Self, SessionError> {
        debug!("Client: {:?}", ClientState::Connecting);
        let stream = UnixStream::connect(socket_path)
            .await
            .map_err(|source| SessionError::Connect {
                path: socket_path.display().to_string(),
                source,
            })?;
        debug!("Connected to {:?}", socket_path);

        Ok(Self {
            stream,
            state: ClientState::Connecting,
        })
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    fn transition(&mut self, next: ClientState) {
        debug!("Client: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Send the command descriptor. Must be the first thing on the wire.
    pub async fn send_command(
        &mut self,
        descriptor: &CommandDescriptor,
    ) -> Result<(), SessionError> {
        self.transition(ClientState::SendingCommand);
        let line = descriptor.to_line()?;
        debug!("Sending: {}", String::from_utf8_lossy(&line).trim_end());

        self.stream
            .write_all(&line)
            .await
            .map_err(|source| SessionError::Stream {
                direction: "handshake",
                source,
            })
    }

    /// Copy `input` to the server and server output to `output`, sending a
    /// resize line for every size received on `resizes`.
    ///
    /// Returns as soon as either direction reaches end of stream or fails.
    /// Resize lines and input share one writer, so a resize is never spliced
    /// into the middle of a single input chunk.
    pub async fn duplex<I, O>(
        &mut self,
        mut input: I,
        mut output: O,
        mut resizes: mpsc::Receiver<TermSize>,
    ) -> Result<(), SessionError>
    where
        I: AsyncRead + Unpin,
        O: AsyncWrite + Unpin,
    {
        self.transition(ClientState::Duplexing);
        let (mut reader, mut writer) = self.stream.split();

        let upstream = async {
            let stream_error = |source| SessionError::Stream {
                direction: "stdin -> socket",
                source,
            };
            let mut buf = vec![0u8; COPY_BUFFER_SIZE];
            let mut resizes_open = true;

            loop {
                tokio::select! {
                    read = input.read(&mut buf) => {
                        let n = read.map_err(stream_error)?;
                        if n == 0 {
                            debug!("Local input reached EOF");
                            return Ok::<(), SessionError>(());
                        }
                        writer.write_all(&buf[..n]).await.map_err(stream_error)?;
                    }
                    size = resizes.recv(), if resizes_open => match size {
                        Some(size) => {
                            let resize = ResizeNotification::new(size.cols, size.rows);
                            writer.write_all(&resize.encode()).await.map_err(stream_error)?;
                            debug!("Sent resize {}", size);
                        }
                        None => resizes_open = false,
                    },
                }
            }
        };

        let downstream = async {
            let stream_error = |source| SessionError::Stream {
                direction: "socket -> stdout",
                source,
            };
            let mut buf = vec![0u8; COPY_BUFFER_SIZE];

            loop {
                let n = reader.read(&mut buf).await.map_err(stream_error)?;
                if n == 0 {
                    debug!("Server closed the connection");
                    return Ok::<(), SessionError>(());
                }
                output.write_all(&buf[..n]).await.map_err(stream_error)?;
                output.flush().await.map_err(stream_error)?;
            }
        };

        let result = tokio::select! {
            result = upstream => result,
            result = downstream => result,
        };
        self.transition(ClientState::Restoring);
        result
    }

    /// Like [`Client::duplex`], but gives up as soon as `stop` resolves with
    /// the name of the signal that ended the session.
    pub async fn attach<I, O, S>(
        &mut self,
        input: I,
        output: O,
        resizes: mpsc::Receiver<TermSize>,
        stop: S,
    ) -> anyhow::Result<()>
    where
        I: AsyncRead + Unpin,
        O: AsyncWrite + Unpin,
        S: Future<Output = &'static str>,
    {
        tokio::select! {
            result = self.duplex(input, output, resizes) => result.map_err(Into::into),
            name = stop => {
                warn!("Received {} while {:?}, detaching", name, self.state());
                self.transition(ClientState::Restoring);
                anyhow::bail!("terminated by {}", name)
            }
        }
    }
}

/// Resolve with the name of the first signal that should end the client.
async fn exit_signal() -> &'static str {
    tokio::select! {
        _ = unix_signal(SignalKind::terminate(), "SIGTERM") => "SIGTERM",
        _ = unix_signal(SignalKind::hangup(), "SIGHUP") => "SIGHUP",
        _ = unix_signal(SignalKind::quit(), "SIGQUIT") => "SIGQUIT",
    }
}

/// Forward the local terminal size on every SIGWINCH.
///
/// Size query failures are logged and skipped; they never end the session.
fn watch_resizes() -> std::io::Result<mpsc::Receiver<TermSize>> {
    let mut winch = signal(SignalKind::window_change())?;
    let (tx, rx) = mpsc::channel(8);

    tokio::spawn(async move {
        while winch.recv().await.is_some() {
            match terminal::current_size() {
                Ok(size) => {
                    if tx.send(size).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Failed to query terminal size: {}", e),
            }
        }
    });

    Ok(rx)
}

/// Run `command` on the server behind `socket_path`, attached to this
/// process's terminal.
///
/// The terminal is restored before this returns, whatever the outcome.
pub async fn run(socket_path: &Path, command: Vec<String>) -> anyhow::Result<()> {
    let mut client = Client::connect(socket_path).await?;

    let size = terminal::size_or_default();
    let descriptor = CommandDescriptor::new(command, size.cols, size.rows);
    client.send_command(&descriptor).await?;

    let resizes = match watch_resizes() {
        Ok(rx) => rx,
        Err(e) => {
            warn!("Resize events unavailable: {}", e);
            mpsc::channel(1).1
        }
    };

    client.transition(ClientState::RawMode);
    let raw_mode = if terminal::stdin_is_terminal() {
        Some(RawModeGuard::enter().context("Failed to put terminal into raw mode")?)
    } else {
        debug!("stdin is not a terminal, leaving mode unchanged");
        None
    };

    let result = client
        .attach(
            tokio::io::stdin(),
            tokio::io::stdout(),
            resizes,
            exit_signal(),
        )
        .await;

    drop(raw_mode);
    client.transition(ClientState::Done);
    info!("Session ended");

    result
}
