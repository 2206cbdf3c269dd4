//! Error taxonomy shared by the server and client.

use thiserror::Error;

/// Everything that can end or disturb a session.
///
/// Only [`SessionError::PtyResize`] and [`SessionError::MalformedResize`] are
/// recoverable; every other variant ends the session it occurred in.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The client could not reach the server socket.
    #[error("failed to connect to {path}: {source}")]
    Connect {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The leading command descriptor could not be decoded.
    #[error("invalid command descriptor: {0}")]
    Decode(String),

    /// argv[0] is not on the configured allow-list.
    #[error("command '{0}' is not allowed")]
    NotAllowed(String),

    #[error("failed to allocate PTY: {0}")]
    PtyAllocation(String),

    #[error("failed to spawn '{command}': {reason}")]
    ProcessSpawn { command: String, reason: String },

    #[error("failed to resize PTY to {cols}x{rows}: {reason}")]
    PtyResize { cols: u16, rows: u16, reason: String },

    #[error("malformed resize request: {0:?}")]
    MalformedResize(String),

    /// One half of a duplex copy failed.
    #[error("stream error ({direction}): {source}")]
    Stream {
        direction: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl SessionError {
    /// Whether the session may continue after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SessionError::PtyResize { .. } | SessionError::MalformedResize(_)
        )
    }

    pub fn decode(message: impl Into<String>) -> Self {
        SessionError::Decode(message.into())
    }

    pub fn spawn_failed(command: &[String], reason: impl ToString) -> Self {
        let command = if command.is_empty() {
            "(empty command)".to_string()
        } else {
            command.join(" ")
        };
        SessionError::ProcessSpawn {
            command,
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_resize_errors_are_recoverable() {
        assert!(SessionError::PtyResize {
            cols: 80,
            rows: 24,
            reason: "ioctl".into()
        }
        .is_recoverable());
        assert!(SessionError::MalformedResize("resize:a:b".into()).is_recoverable());

        assert!(!SessionError::decode("bad json").is_recoverable());
        assert!(!SessionError::NotAllowed("rm".into()).is_recoverable());
        assert!(!SessionError::PtyAllocation("out of ptys".into()).is_recoverable());
        assert!(!SessionError::Stream {
            direction: "pty -> socket",
            source: std::io::Error::from(std::io::ErrorKind::BrokenPipe),
        }
        .is_recoverable());
    }

    #[test]
    fn test_spawn_failed_message_includes_command() {
        let cmd = vec!["vim".to_string(), "file.txt".to_string()];
        let err = SessionError::spawn_failed(&cmd, "No such file or directory");
        let message = err.to_string();
        assert!(message.contains("vim file.txt"));
        assert!(message.contains("No such file or directory"));
    }

    #[test]
    fn test_spawn_failed_empty_command() {
        let err = SessionError::spawn_failed(&[], "no command");
        assert!(err.to_string().contains("(empty command)"));
    }

    #[test]
    fn test_not_allowed_display() {
        let err = SessionError::NotAllowed("rm".into());
        assert_eq!(err.to_string(), "command 'rm' is not allowed");
    }
}
