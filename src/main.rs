//! shell-gate: interactive shells over the network
//!
//! Two listeners feed one connection engine:
//! - a console port for telnet/netcat, framed by lines (telnet-aware)
//! - a WebSocket port, framed by RFC 6455 text frames
//!
//! Features:
//! - Thread-per-connection blocking I/O
//! - Immediate forwarding of ctrl-D and telnet interrupt sequences
//! - Safe shutdown of a connection from any thread
//! - Connection report (`stats` in the built-in shell)
//! - Configuration via CLI arguments or TOML file

mod config;
mod error;
mod handler;
mod protocols;
mod runtime;
mod server;
mod shell;

use config::Config;
use runtime::Mode;
use server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        console = %config.console,
        websocket = ?config.websocket,
        max_connections = config.max_connections,
        "Starting shell-gate server"
    );

    let running = Server::new(config).bind()?;
    info!(
        console = ?running.local_addr(Mode::Line),
        websocket = ?running.local_addr(Mode::WebSocket),
        "Accepting connections"
    );
    running.wait();
    Ok(())
}
