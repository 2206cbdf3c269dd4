//! Wire types for the client-server handshake and control lines.

use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// Prefix that marks a resize control line inside the data stream.
pub const RESIZE_PREFIX: &[u8] = b"resize:";

/// Maximum size of the leading descriptor line, newline included.
pub const MAX_HANDSHAKE_SIZE: usize = 64 * 1024;

/// The command to run and the client's terminal size at connect time.
///
/// Sent exactly once, as the first line on a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandDescriptor {
    #[serde(rename = "Command")]
    pub command: Vec<String>,
    #[serde(rename = "Width")]
    pub width: u16,
    #[serde(rename = "Height")]
    pub height: u16,
}

impl CommandDescriptor {
    pub fn new(command: Vec<String>, width: u16, height: u16) -> Self {
        Self {
            command,
            width,
            height,
        }
    }

    /// Program name, i.e. argv[0].
    pub fn program(&self) -> Option<&str> {
        self.command.first().map(String::as_str)
    }

    /// Serialize as a single JSON line terminated by `\n`.
    pub fn to_line(&self) -> Result<Vec<u8>, SessionError> {
        let mut line = serde_json::to_vec(self)
            .map_err(|e| SessionError::decode(format!("failed to encode: {}", e)))?;
        line.push(b'\n');
        Ok(line)
    }

    /// Decode one descriptor line (trailing `\r\n` or `\n` tolerated).
    ///
    /// Rejects an empty argv so no caller can reach spawn without a program.
    pub fn from_line(line: &[u8]) -> Result<Self, SessionError> {
        let text = std::str::from_utf8(line)
            .map_err(|_| SessionError::decode("descriptor is not valid UTF-8"))?;
        let text = text.trim_end_matches(&['\r', '\n'][..]);

        let descriptor: CommandDescriptor =
            serde_json::from_str(text).map_err(|e| SessionError::decode(e.to_string()))?;

        match descriptor.program() {
            None => Err(SessionError::decode("no command provided")),
            Some("") => Err(SessionError::decode("program name is empty")),
            Some(_) => Ok(descriptor),
        }
    }
}

/// A change in the client's terminal geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizeNotification {
    pub width: u16,
    pub height: u16,
}

impl ResizeNotification {
    pub fn new(width: u16, height: u16) -> Self {
        Self { width, height }
    }

    /// The exact control line: `resize:<width>:<height>\n`.
    pub fn encode(&self) -> Vec<u8> {
        format!("resize:{}:{}\n", self.width, self.height).into_bytes()
    }

    /// Parse the part after the `resize:` prefix, e.g. `120:40`.
    ///
    /// Surrounding whitespace (including a trailing `\r`) is ignored.
    pub fn parse_body(body: &[u8]) -> Result<Self, SessionError> {
        let malformed = || {
            SessionError::MalformedResize(format!(
                "resize:{}",
                String::from_utf8_lossy(body).trim_end()
            ))
        };

        let text = std::str::from_utf8(body).map_err(|_| malformed())?.trim();
        let mut parts = text.split(':');
        let (Some(width), Some(height), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(malformed());
        };

        let width = width.parse::<u16>().map_err(|_| malformed())?;
        let height = height.parse::<u16>().map_err(|_| malformed())?;
        Ok(Self { width, height })
    }
}
