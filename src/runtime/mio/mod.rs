//! mio-based event loop implementation.
//!
//! Readiness-based I/O using mio (epoll on Linux, kqueue on macOS).
//! Thread-per-core: every worker owns a poll instance, a listener bound with
//! SO_REUSEPORT, and the connections it accepted.

mod event_loop;

use crate::config::Config;

/// Run the server using mio backend.
pub fn run(config: Config) -> std::io::Result<()> {
    event_loop::run(config)
}
