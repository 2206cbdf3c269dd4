//! Server and client halves of hrun.

pub mod client;
pub mod paths;
pub mod pty;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod terminal;

// Public API - used by main.rs
pub use server::Server;
pub use shutdown::ShutdownSignal;
