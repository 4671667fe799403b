//! cmdserver: an event-driven command server
//!
//! Clients send newline-delimited commands over TCP and get one textual
//! result per command, sequentially on the same connection:
//! - `ping`: liveness check
//! - `cat <path>`: stream a file's contents
//! - `sum <n1> <n2> ...`: add integers
//!
//! Large responses are produced in bounded chunks so no connection can hold
//! the reactor while a file is streamed or a long sum is drained.
//!
//! Configuration via CLI arguments or TOML file.

mod config;
mod protocols;
mod runtime;
mod server;

use config::{Config, RuntimeType};
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
        listen = %config.listen,
        runtime = ?config.runtime,
        workers = config.workers,
        chunk_size = config.chunk_size,
        "Starting cmdserver"
    );

    match config.runtime {
        RuntimeType::Mio => info!("Using mio runtime (epoll/kqueue)"),
        RuntimeType::Tokio => info!("Using tokio runtime (task per connection)"),
    }

    runtime::run(config)
}
