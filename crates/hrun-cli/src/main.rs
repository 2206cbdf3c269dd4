//! hrun entry point: server with `--start`, client otherwise.

mod args;
mod daemon;

use anyhow::Context;
use clap::Parser;
use hrun_core::allow::AllowList;
use tokio::signal::unix::SignalKind;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::args::Cli;
use crate::daemon::shutdown::unix_signal;
use crate::daemon::{client, paths, Server, ShutdownSignal};

fn main() {
    let cli = Cli::parse();

    // The client shares its stderr with the remote terminal, so keep it quiet.
    let default_level = if cli.start { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = if cli.start {
        run_server(cli)
    } else {
        run_client(cli)
    };

    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

/// Run the server until SIGINT, SIGTERM or SIGQUIT.
///
/// The Server's Drop impl removes the socket file.
fn run_server(cli: Cli) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;

    runtime.block_on(async {
        let socket_path = paths::get_socket_path(cli.socket);
        let server = Server::bind(socket_path, AllowList::new(cli.allowed_cmd)).await?;

        let shutdown = ShutdownSignal::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            trigger.trigger();
        });

        server.run(shutdown).await?;
        // Server is dropped here, removing the socket file
        info!("Server stopped, removing {}", server.socket_path().display());
        Ok::<(), anyhow::Error>(())
    })
}

/// Connect to the server and attach the local terminal to the command.
fn run_client(cli: Cli) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
    let socket_path = paths::get_socket_path(cli.socket.clone());
    let command = cli.command_or_shell();

    let result = runtime.block_on(client::run(&socket_path, command));

    // Reading stdin parks a blocking thread that only returns on the next
    // keystroke; don't wait for it.
    runtime.shutdown_background();
    result
}

/// Wait for the first shutdown signal.
///
/// If a handler can't be registered, logs a warning and relies on the others.
async fn wait_for_signal() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
        _ = unix_signal(SignalKind::terminate(), "SIGTERM") => {
            info!("Received SIGTERM, shutting down");
        }
        _ = unix_signal(SignalKind::quit(), "SIGQUIT") => {
            info!("Received SIGQUIT, shutting down");
        }
    }
}
