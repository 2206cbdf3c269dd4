//! Core types for hrun.
//!
//! hrun runs a command inside a PTY on the host and streams it to a client
//! over a unix socket. This crate holds the pieces that do no I/O of their
//! own:
//!
//! - [`protocol`]: the leading command descriptor and resize control lines
//! - [`codec`]: the single-cursor decoder that splits resize lines out of the
//!   terminal data stream
//! - [`allow`]: the server's command allow-list
//! - [`error`]: the session error taxonomy
//!
//! # Wire format
//!
//! | Position | Content |
//! |----------|---------|
//! | First line | `{"Command":["ls","-la"],"Width":80,"Height":24}\n` |
//! | Afterwards | raw terminal bytes, with `resize:<w>:<h>\n` spliced in anywhere |

pub mod allow;
pub mod codec;
pub mod error;
pub mod protocol;
