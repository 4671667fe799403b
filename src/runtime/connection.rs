//! Connection state machine for the command protocol.
//!
//! Each connection owns its buffered input and at most one in-flight
//! command. Reactor adapters feed it readiness notifications:
//!
//! - `on_readable`: new bytes arrived; parse and dispatch when idle
//! - `on_writable`: the transport drained; produce the next bounded chunk
//! - `on_error` / `on_closed`: tear down and release everything
//!
//! Output is appended to an outbound buffer owned by the adapter, which is
//! responsible for flushing it to the socket.

use crate::protocols::parser::{parse, CommandKind, ParseResult};
use crate::protocols::{cat, ping, sum, Response, Step};
use crate::protocols::cat::CatStream;
use crate::protocols::sum::SumStream;
use bytes::{Buf, BytesMut};
use std::io;
use tracing::{debug, trace};

/// Per-connection limits.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Maximum file bytes read per writable turn.
    pub chunk_size: usize,
    /// Longest partial command line buffered before it is rejected.
    pub max_line: usize,
    /// Maximum buffered input, including input held while producing.
    pub max_input: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            chunk_size: 256,
            max_line: 64 * 1024,
            max_input: 1024 * 1024,
        }
    }
}

/// A command producing output across multiple writable turns.
#[derive(Debug)]
pub enum Producer {
    Cat(CatStream),
    Sum(SumStream),
}

impl Producer {
    pub fn kind(&self) -> CommandKind {
        match self {
            Producer::Cat(_) => CommandKind::Cat,
            Producer::Sum(_) => CommandKind::Sum,
        }
    }
}

/// Current state of a connection.
#[derive(Debug)]
pub enum ConnState {
    /// Ready to parse the next command line.
    Idle,
    /// A command is streaming its response.
    Producing(Producer),
    /// Terminal. Resources are released and callbacks are ignored.
    Closed,
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    state: ConnState,
    input: BytesMut,
    limits: Limits,
    /// Set after a `ping` fired on its prefix alone: the remainder of its
    /// line is still to arrive and is discarded.
    skip_line: bool,
}

impl Connection {
    /// Create a new connection in the idle state.
    pub fn new(limits: Limits) -> Self {
        Self {
            state: ConnState::Idle,
            input: BytesMut::new(),
            limits,
            skip_line: false,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> &ConnState {
        &self.state
    }

    /// The command in flight, if any.
    pub fn active_command(&self) -> Option<CommandKind> {
        match &self.state {
            ConnState::Producing(producer) => Some(producer.kind()),
            ConnState::Idle | ConnState::Closed => None,
        }
    }

    pub fn is_producing(&self) -> bool {
        matches!(self.state, ConnState::Producing(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, ConnState::Closed)
    }

    /// Bytes of input received but not yet consumed by a command.
    pub fn buffered(&self) -> usize {
        self.input.len()
    }

    /// Descriptor of the file being streamed by `cat`.
    #[cfg(test)]
    pub fn open_file(&self) -> Option<std::os::unix::io::RawFd> {
        use std::os::unix::io::AsRawFd;

        match &self.state {
            ConnState::Producing(Producer::Cat(stream)) => Some(stream.as_raw_fd()),
            _ => None,
        }
    }

    /// Handle newly read bytes.
    ///
    /// Input is always buffered; it is only parsed while idle. Exceeding
    /// `max_input` closes the connection.
    pub fn on_readable(&mut self, bytes: &[u8], out: &mut BytesMut) -> io::Result<()> {
        if self.is_closed() {
            return Ok(());
        }

        self.input.extend_from_slice(bytes);
        if self.input.len() > self.limits.max_input {
            self.close();
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "input buffer limit exceeded",
            ));
        }

        self.dispatch(out);
        Ok(())
    }

    /// Handle transport write readiness.
    ///
    /// Produces at most one chunk of the active command. When the command
    /// completes, its resources are dropped and any buffered input is
    /// dispatched.
    pub fn on_writable(&mut self, out: &mut BytesMut) -> io::Result<()> {
        let chunk_size = self.limits.chunk_size;
        let result = match &mut self.state {
            ConnState::Producing(Producer::Cat(stream)) => stream.produce(out, chunk_size),
            ConnState::Producing(Producer::Sum(stream)) => Ok(stream.produce(out)),
            ConnState::Idle | ConnState::Closed => return Ok(()),
        };

        match result {
            Ok(Step::Continue) => Ok(()),
            Ok(Step::Done) => {
                if let ConnState::Producing(producer) =
                    std::mem::replace(&mut self.state, ConnState::Idle)
                {
                    trace!(command = producer.kind().as_str(), "command complete");
                }
                self.dispatch(out);
                Ok(())
            }
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    /// Transport failure: tear down.
    pub fn on_error(&mut self, reason: &io::Error) {
        debug!(error = %reason, command = ?self.active_command(), "connection error");
        self.close();
    }

    /// Peer closed or the adapter is shutting the connection down.
    pub fn on_closed(&mut self) {
        self.close();
    }

    /// Release the in-flight command and buffered input. Idempotent.
    pub fn close(&mut self) {
        match std::mem::replace(&mut self.state, ConnState::Closed) {
            ConnState::Producing(Producer::Cat(stream)) => {
                debug!(emitted = stream.emitted(), "dropping in-flight cat");
            }
            ConnState::Producing(Producer::Sum(stream)) => {
                debug!(
                    cursor = stream.cursor(),
                    total = stream.total(),
                    "dropping in-flight sum"
                );
            }
            ConnState::Idle | ConnState::Closed => {}
        }
        self.input = BytesMut::new();
        self.skip_line = false;
    }

    /// Parse and start commands until one is producing or input runs out.
    fn dispatch(&mut self, out: &mut BytesMut) {
        while matches!(self.state, ConnState::Idle) {
            if self.skip_line {
                match self.input.iter().position(|&b| b == b'\n') {
                    Some(end) => {
                        self.input.advance(end + 1);
                        self.skip_line = false;
                    }
                    None => {
                        self.input.clear();
                        break;
                    }
                }
            }

            match parse(&self.input, self.limits.max_line) {
                ParseResult::NeedMoreData => break,
                ParseResult::Unrecognized => {
                    trace!(discarded = self.input.len(), "invalid command");
                    out.extend_from_slice(Response::invalid_command());
                    self.input.clear();
                    break;
                }
                ParseResult::Recognized(command) => {
                    trace!(command = command.kind.as_str(), "dispatching");
                    let args = &self.input[command.remainder.clone()];
                    match command.kind {
                        CommandKind::Ping => ping::respond(out),
                        CommandKind::Cat => {
                            if let Some(stream) = cat::begin(args, out) {
                                self.state = ConnState::Producing(Producer::Cat(stream));
                            }
                        }
                        CommandKind::Sum => {
                            self.state = ConnState::Producing(Producer::Sum(sum::begin(args, out)));
                        }
                    }
                    self.input.advance(command.consumed);
                    self.skip_line = !command.terminated;
                }
            }
        }
    }
}
