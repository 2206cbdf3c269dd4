//! Server side of one connection: handshake, PTY, duplex copy, teardown.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use hrun_core::allow::AllowList;
use hrun_core::codec::{Frame, StreamDecoder};
use hrun_core::error::SessionError;
use hrun_core::protocol::{CommandDescriptor, MAX_HANDSHAKE_SIZE};
use portable_pty::ExitStatus;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::daemon::pty::{PtyController, PtyPair, TermSize};
use crate::daemon::shutdown::ShutdownSignal;

/// Buffer size for reading from the client.
const READ_BUFFER_SIZE: usize = 4096;

/// How long PTY output may keep flowing after the child exited.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Idle time after which bytes held as a possible resize line are forwarded.
const INPUT_IDLE_FLUSH: Duration = Duration::from_millis(20);

/// How long to wait for an exit status once the PTY has closed.
const EXIT_STATUS_TIMEOUT: Duration = Duration::from_secs(1);

/// Unique identifier for a session, used to correlate log lines.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generate a new unique session ID.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a server session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingCommand,
    AllowlistCheck,
    PtyStarting,
    Running,
    Closing,
    Closed,
}

/// Why a session stopped.
#[derive(Debug)]
pub enum SessionEnd {
    /// The client closed its side of the connection.
    ClientClosed,
    /// The child exited.
    ChildExited(ExitStatus),
    /// PTY output ended but no exit status could be collected.
    PtyClosed,
    /// The host is shutting down.
    Shutdown,
    /// A duplex copy failed.
    StreamFailed(SessionError),
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEnd::ClientClosed => write!(f, "client closed connection"),
            SessionEnd::ChildExited(status) => {
                write!(f, "child exited with code {}", status.exit_code())
            }
            SessionEnd::PtyClosed => write!(f, "PTY closed"),
            SessionEnd::Shutdown => write!(f, "server shutting down"),
            SessionEnd::StreamFailed(e) => write!(f, "{}", e),
        }
    }
}

/// Drives one accepted connection through its whole lifecycle.
pub struct SessionHandler {
    id: SessionId,
    allow: Arc<AllowList>,
    shutdown: ShutdownSignal,
    state: SessionState,
}

impl SessionHandler {
    pub fn new(allow: Arc<AllowList>, shutdown: ShutdownSignal) -> Self {
        Self {
            id: SessionId::new(),
            allow,
            shutdown,
            state: SessionState::AwaitingCommand,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    fn transition(&mut self, next: SessionState) {
        debug!("Session {}: {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
    }

    /// Run the session to completion.
    ///
    /// Errors are returned only for sessions that never reached `Running`;
    /// no process was spawned for them. Once running, every way of ending is
    /// reported as a [`SessionEnd`].
    pub async fn run(mut self, stream: UnixStream) -> Result<SessionEnd, SessionError> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let result = self.serve(&mut reader, &mut writer).await;

        // Close the connection on every path.
        if let Err(e) = writer.shutdown().await {
            debug!("Session {}: socket shutdown failed: {}", self.id, e);
        }
        drop(writer);
        drop(reader);
        self.transition(SessionState::Closed);

        result
    }

    async fn serve<R, W>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
    ) -> Result<SessionEnd, SessionError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let descriptor = tokio::select! {
            result = read_descriptor(reader) => result?,
            _ = self.shutdown.wait() => return Ok(SessionEnd::Shutdown),
        };
        info!(
            "Session {}: received command {:?} ({}x{})",
            self.id, descriptor.command, descriptor.width, descriptor.height
        );

        self.transition(SessionState::AllowlistCheck);
        let program = descriptor.program().unwrap_or_default();
        if !self.allow.permits(program) {
            return Err(SessionError::NotAllowed(program.to_string()));
        }

        // The descriptor may have landed just as shutdown began.
        if self.shutdown.is_triggered() {
            return Ok(SessionEnd::Shutdown);
        }

        self.transition(SessionState::PtyStarting);
        let size = TermSize::from(&descriptor);
        let pair = PtyPair::open(size)?;
        debug!("Session {}: PTY created at {}", self.id, size);
        let pty = PtyController::new(pair.spawn(&descriptor.command)?)?;
        info!(
            "Session {}: started {:?} (pid {:?})",
            self.id,
            descriptor.command,
            pty.pid()
        );

        self.transition(SessionState::Running);
        let end = self.duplex(&pty, reader, writer).await;

        self.transition(SessionState::Closing);
        pty.kill();
        if timeout(EXIT_STATUS_TIMEOUT, pty.wait()).await.is_err() {
            warn!("Session {}: child not reaped after kill", self.id);
        }
        Ok(end)
    }

    /// Copy in both directions until one side ends.
    async fn duplex<R, W>(
        &self,
        pty: &PtyController,
        reader: &mut R,
        writer: &mut W,
    ) -> SessionEnd
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        enum Event {
            OutputDone(Result<(), SessionError>),
            InputDone(Result<(), SessionError>),
            Exited(ExitStatus),
            Shutdown,
        }

        let output = pump_output(pty, writer);
        let input = pump_input(pty, reader, &self.id);
        let exited = pty.wait();
        tokio::pin!(output, input, exited);

        let event = tokio::select! {
            result = &mut output => Event::OutputDone(result),
            result = &mut input => Event::InputDone(result),
            status = &mut exited => Event::Exited(status),
            _ = self.shutdown.wait() => Event::Shutdown,
        };

        match event {
            Event::OutputDone(Err(e)) | Event::InputDone(Err(e)) => SessionEnd::StreamFailed(e),
            Event::InputDone(Ok(())) => SessionEnd::ClientClosed,
            Event::OutputDone(Ok(())) => match timeout(EXIT_STATUS_TIMEOUT, &mut exited).await {
                Ok(status) => SessionEnd::ChildExited(status),
                Err(_) => SessionEnd::PtyClosed,
            },
            Event::Exited(status) => {
                // Let output the child already produced reach the client.
                match timeout(DRAIN_TIMEOUT, &mut output).await {
                    Ok(Err(e)) => debug!("Session {}: drain failed: {}", self.id, e),
                    Err(_) => debug!("Session {}: PTY still open after child exit", self.id),
                    Ok(Ok(())) => {}
                }
                SessionEnd::ChildExited(status)
            }
            Event::Shutdown => SessionEnd::Shutdown,
        }
    }
}

/// Read the leading descriptor line without consuming anything after it.
///
/// Bytes following the newline stay in `reader` and are decoded as terminal
/// data afterwards.
async fn read_descriptor<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<CommandDescriptor, SessionError> {
    let line = read_line_bounded(reader, MAX_HANDSHAKE_SIZE).await?;
    CommandDescriptor::from_line(&line)
}

/// Read one `\n`-terminated line of at most `max_size` bytes.
///
/// End of stream before the newline is an error: a descriptor must be
/// complete before anything runs.
async fn read_line_bounded<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> Result<Vec<u8>, SessionError> {
    let mut bytes = Vec::new();

    loop {
        let available = reader
            .fill_buf()
            .await
            .map_err(|e| SessionError::decode(format!("failed to read command: {}", e)))?;

        if available.is_empty() {
            return Err(SessionError::decode(
                "connection closed before a command was received",
            ));
        }

        let newline_pos = available.iter().position(|&b| b == b'\n');
        let bytes_to_consume = newline_pos.map(|p| p + 1).unwrap_or(available.len());

        if bytes.len() + bytes_to_consume > max_size {
            return Err(SessionError::decode(format!(
                "command exceeds {} byte limit",
                max_size
            )));
        }

        bytes.extend_from_slice(&available[..bytes_to_consume]);
        reader.consume(bytes_to_consume);

        if newline_pos.is_some() {
            return Ok(bytes);
        }
    }
}

/// PTY output -> client, until the PTY closes.
async fn pump_output<W: AsyncWrite + Unpin>(
    pty: &PtyController,
    writer: &mut W,
) -> Result<(), SessionError> {
    let stream_error = |source| SessionError::Stream {
        direction: "pty -> socket",
        source,
    };

    while let Some(chunk) = pty.read().await {
        writer.write_all(&chunk).await.map_err(stream_error)?;
        writer.flush().await.map_err(stream_error)?;
    }
    Ok(())
}

/// Client -> PTY, splitting resize lines out on the way.
///
/// This is the only reader of the connection once the descriptor is in, so
/// data and resize lines are handled in exactly the order they were sent.
/// Bytes the decoder holds back are forwarded after `INPUT_IDLE_FLUSH` with
/// no further input.
async fn pump_input<R: AsyncRead + Unpin>(
    pty: &PtyController,
    reader: &mut R,
    id: &SessionId,
) -> Result<(), SessionError> {
    let mut decoder = StreamDecoder::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let read = if decoder.pending() > 0 {
            match timeout(INPUT_IDLE_FLUSH, reader.read(&mut buf)).await {
                Ok(read) => read,
                Err(_) => {
                    apply_frames(pty, decoder.flush(), id).await?;
                    continue;
                }
            }
        } else {
            reader.read(&mut buf).await
        };

        let n = read.map_err(|source| SessionError::Stream {
            direction: "socket -> pty",
            source,
        })?;
        if n == 0 {
            debug!("Session {}: client EOF", id);
            apply_frames(pty, decoder.flush(), id).await?;
            return Ok(());
        }

        apply_frames(pty, decoder.feed(&buf[..n]), id).await?;
    }
}

/// Hand decoded frames to the PTY in order.
async fn apply_frames(
    pty: &PtyController,
    frames: Vec<Frame>,
    id: &SessionId,
) -> Result<(), SessionError> {
    for frame in frames {
        match frame {
            Frame::Data(bytes) => pty.write(&bytes).await?,
            Frame::Resize(resize) => {
                let size = TermSize::from(resize);
                let previous = pty.size();
                match pty.resize(size) {
                    Ok(()) => info!("Session {}: terminal resized {} -> {}", id, previous, size),
                    Err(e) if e.is_recoverable() => warn!("Session {}: {}", id, e),
                    Err(e) => return Err(e),
                }
            }
            Frame::MalformedResize(line) => {
                warn!("Session {}: {}", id, SessionError::MalformedResize(line));
            }
        }
    }
    Ok(())
}
