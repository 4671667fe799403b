//! Runtime for the command server.
//!
//! The connection state machine is transport-agnostic; reactor adapters
//! turn socket readiness into calls on it:
//! - `mio`: readiness-based worker threads (epoll/kqueue)
//! - `crate::server`: one tokio task per connection

mod connection;
mod mio;

pub(crate) use connection::{Connection, Limits};

use crate::config::{Config, RuntimeType};

/// Run the server with the configured reactor adapter.
pub fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    match config.runtime {
        RuntimeType::Mio => mio::run(config)?,
        RuntimeType::Tokio => crate::server::run(config)?,
    }
    Ok(())
}
