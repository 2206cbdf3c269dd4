//! CLI argument parsing with clap derive macros.

use std::path::PathBuf;

use clap::Parser;

/// Run commands on a remote PTY over a unix socket.
///
/// Without `--start`, connects to a running server and attaches the local
/// terminal to the given command. With `--start`, runs the server.
#[derive(Debug, Parser)]
#[command(
    name = "hrun",
    version,
    after_help = "\
Examples:
  hrun --start                          # Serve on /tmp/hrun.sock
  hrun --start --allowed-cmd ls \\
       --allowed-cmd cat                # Only allow ls and cat
  hrun                                  # Open a login shell on the server
  hrun ls -la /                         # Run a single command
  hrun --socket /run/hrun.sock htop     # Use a different socket

Environment:
  HRUN_SOCKET   Socket path when --socket is not given
  RUST_LOG      Log filter (default: info for the server, warn for the client)"
)]
pub struct Cli {
    /// Start the server instead of connecting to one
    #[arg(long)]
    pub start: bool,

    /// Program the server may run (repeatable). If omitted, any program is allowed
    #[arg(long = "allowed-cmd", value_name = "NAME")]
    pub allowed_cmd: Vec<String>,

    /// Socket path [default: $HRUN_SOCKET or /tmp/hrun.sock]
    #[arg(long, value_name = "PATH")]
    pub socket: Option<PathBuf>,

    /// Command and arguments to run remotely [default: $SHELL -l]
    #[arg(num_args = 1.., trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl Cli {
    /// The command to send, falling back to the user's login shell.
    pub fn command_or_shell(&self) -> Vec<String> {
        if self.command.is_empty() {
            default_command(std::env::var("SHELL").ok())
        } else {
            self.command.clone()
        }
    }
}

/// A login shell invocation for `shell`, or `/bin/sh` when unset or empty.
fn default_command(shell: Option<String>) -> Vec<String> {
    let shell = shell
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string());
    vec![shell, "-l".to_string()]
}

#[cfg(test)]
mod tests {
    use super::{default_command, Cli};
    use clap::Parser;
    use std::path::PathBuf;

    #[test]
    fn test_command_parses_hyphenated_args() {
        let cli = Cli::parse_from(["hrun", "bash", "-c", "echo hello"]);
        assert!(!cli.start);
        assert_eq!(cli.command, vec!["bash", "-c", "echo hello"]);
    }

    #[test]
    fn test_flags_after_command_belong_to_command() {
        let cli = Cli::parse_from(["hrun", "ls", "--socket", "-la"]);
        assert_eq!(cli.socket, None);
        assert_eq!(cli.command, vec!["ls", "--socket", "-la"]);
    }

    #[test]
    fn test_server_flags() {
        let cli = Cli::parse_from([
            "hrun",
            "--start",
            "--allowed-cmd",
            "ls",
            "--allowed-cmd",
            "cat",
            "--socket",
            "/tmp/x.sock",
        ]);
        assert!(cli.start);
        assert_eq!(cli.allowed_cmd, vec!["ls", "cat"]);
        assert_eq!(cli.socket, Some(PathBuf::from("/tmp/x.sock")));
        assert!(cli.command.is_empty());
    }

    #[test]
    fn test_explicit_command_is_kept() {
        let cli = Cli::parse_from(["hrun", "top"]);
        assert_eq!(cli.command_or_shell(), vec!["top"]);
    }

    #[test]
    fn test_default_command_is_login_shell() {
        assert_eq!(
            default_command(Some("/bin/zsh".to_string())),
            vec!["/bin/zsh", "-l"]
        );
        assert_eq!(default_command(None), vec!["/bin/sh", "-l"]);
        assert_eq!(default_command(Some(String::new())), vec!["/bin/sh", "-l"]);
    }

    #[test]
    fn test_help_is_an_early_exit() {
        let err = Cli::try_parse_from(["hrun", "--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }
}
