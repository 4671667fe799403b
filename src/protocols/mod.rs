//! Command protocol implementation.
//!
//! Line-oriented ASCII commands, one in flight per connection:
//! - `ping`: health check, answered in a single chunk
//! - `cat <path>`: streams a file's bytes across many writable turns
//! - `sum <n1> <n2> ...`: accumulates a running total one token at a time
//!
//! ## Protocol Format
//!
//! ```text
//! Request:  ping\n
//! Response: S pong\n
//!
//! Request:  cat /etc/hostname\n
//! Response: S myhost\n\n
//!
//! Request:  sum 1 2 3\n
//! Response: S 6\n
//! ```
//!
//! Handlers never touch the socket. They append to the outbound transport
//! buffer and report whether they have more to produce.

pub mod cat;
pub mod parser;
pub mod ping;
pub mod sum;

/// Outcome of asking a streaming handler for its next chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// More output remains; call again on the next writable turn.
    Continue,
    /// The response is complete and the handler's resources can be dropped.
    Done,
}

/// Fixed protocol responses.
pub struct Response;

impl Response {
    /// Success marker prefixed to every successful response.
    pub fn success() -> &'static [u8] {
        b"S "
    }

    pub fn pong() -> &'static [u8] {
        b"S pong\n"
    }

    pub fn invalid_command() -> &'static [u8] {
        b"E Invalid command....\n"
    }

    pub fn no_such_file() -> &'static [u8] {
        b"E No such file\n"
    }

    pub fn file_name_required() -> &'static [u8] {
        b"E file name is required.\n"
    }
}
