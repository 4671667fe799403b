//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! ## Chunked Responses
//!
//! Streaming commands (`cat`, `sum`) produce one bounded chunk per engine
//! step. The outbound buffer is flushed before the next step is taken, so a
//! connection never holds more than one chunk of pending output. Each
//! service pass grants at most `write_budget` steps; a connection that still
//! has output to produce is queued and revisited after a zero-timeout poll,
//! letting every other ready connection run first.

use crate::config::Config;
use crate::runtime::{Connection, Limits};
use bytes::{Buf, BytesMut};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token};
use slab::Slab;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Bytes read from a socket per syscall.
const READ_CHUNK: usize = 4096;

const EVENTS_CAPACITY: usize = 1024;

/// Per-worker connection state for mio backend.
struct MioConnection {
    stream: TcpStream,
    peer: SocketAddr,
    /// Command engine for this connection.
    conn: Connection,
    /// Bytes produced by the engine and not yet accepted by the socket.
    out: BytesMut,
    /// Already waiting in the worker's revisit queue.
    queued: bool,
}

/// What a service pass left behind.
#[derive(Debug, PartialEq, Eq)]
enum Service {
    /// Nothing left to write or produce.
    Idle,
    /// Socket buffer full; wait for the next writable event.
    Blocked,
    /// Budget spent with output still to produce.
    Yielded,
}

/// Per-worker settings.
#[derive(Debug, Clone, Copy)]
struct WorkerSettings {
    limits: Limits,
    max_connections: usize,
    write_budget: usize,
}

impl WorkerSettings {
    fn from_config(config: &Config) -> Self {
        Self {
            limits: config.limits(),
            max_connections: config.max_connections,
            write_budget: config.write_budget,
        }
    }
}

/// Run the mio-based server.
pub fn run(config: Config) -> io::Result<()> {
    let num_workers = if config.workers == 0 {
        num_cpus()
    } else {
        config.workers
    };

    let addr = resolve(&config.listen)?;
    let settings = WorkerSettings::from_config(&config);

    info!(
        workers = num_workers,
        addr = %addr,
        chunk_size = settings.limits.chunk_size,
        write_budget = settings.write_budget,
        "Starting mio runtime"
    );

    let mut handles = Vec::with_capacity(num_workers);

    for worker_id in 0..num_workers {
        // Create listener with SO_REUSEPORT for kernel load balancing
        let listener = create_listener_with_reuseport(addr)?;

        let handle = thread::Builder::new()
            .name(format!("worker-{worker_id}"))
            .spawn(move || {
                if let Err(e) = worker_loop(worker_id, listener, settings) {
                    error!(worker = worker_id, error = %e, "Worker failed");
                }
            })?;

        handles.push(handle);
    }

    // Wait for all workers
    for handle in handles {
        let _ = handle.join();
    }

    Ok(())
}

fn worker_loop(
    worker_id: usize,
    listener: std::net::TcpListener,
    settings: WorkerSettings,
) -> io::Result<()> {
    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(EVENTS_CAPACITY);

    let mut listener = TcpListener::from_std(listener);
    poll.registry()
        .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

    let mut connections: Slab<MioConnection> = Slab::with_capacity(settings.max_connections);
    let mut revisit: VecDeque<usize> = VecDeque::new();

    info!(
        worker = worker_id,
        max_connections = settings.max_connections,
        "Worker started"
    );

    loop {
        let timeout = if revisit.is_empty() {
            None
        } else {
            Some(Duration::ZERO)
        };

        if let Err(e) = poll.poll(&mut events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }

        for event in events.iter() {
            match event.token() {
                LISTENER_TOKEN => {
                    accept_connections(&listener, &mut poll, &mut connections, settings, worker_id)?;
                }
                Token(conn_id) => {
                    if let Err(e) = handle_connection_event(
                        conn_id,
                        event,
                        &mut connections,
                        &mut revisit,
                        settings.write_budget,
                    ) {
                        close_connection(&mut poll, &mut connections, conn_id, &e);
                    }
                }
            }
        }

        // Connections that spent their budget get another pass now that
        // everything else ready in this round has been served.
        for _ in 0..revisit.len() {
            let Some(conn_id) = revisit.pop_front() else {
                break;
            };
            let Some(conn) = connections.get_mut(conn_id) else {
                continue;
            };
            conn.queued = false;

            if let Err(e) = service_and_requeue(conn_id, conn, &mut revisit, settings.write_budget)
            {
                close_connection(&mut poll, &mut connections, conn_id, &e);
            }
        }
    }
}

fn accept_connections(
    listener: &TcpListener,
    poll: &mut Poll,
    connections: &mut Slab<MioConnection>,
    settings: WorkerSettings,
    worker_id: usize,
) -> io::Result<()> {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                if connections.len() >= settings.max_connections {
                    warn!(peer = %peer, "Connection limit reached");
                    continue;
                }

                let conn = MioConnection {
                    stream,
                    peer,
                    conn: Connection::new(settings.limits),
                    out: BytesMut::with_capacity(settings.limits.chunk_size * 2),
                    queued: false,
                };

                match register_connection(poll.registry(), connections, conn) {
                    Ok(conn_id) => debug!(
                        worker = worker_id,
                        conn_id,
                        peer = %peer,
                        "Accepted connection"
                    ),
                    Err(e) => warn!(peer = %peer, error = %e, "Failed to register connection"),
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                error!("Accept error: {}", e);
                break;
            }
        }
    }
    Ok(())
}

/// Store a connection and register it for readiness events. On failure the
/// slot is released again and the stream dropped.
fn register_connection(
    registry: &Registry,
    connections: &mut Slab<MioConnection>,
    conn: MioConnection,
) -> io::Result<usize> {
    let conn_id = connections.insert(conn);
    let conn = &mut connections[conn_id];
    if let Err(e) = registry.register(
        &mut conn.stream,
        Token(conn_id),
        Interest::READABLE | Interest::WRITABLE,
    ) {
        connections.remove(conn_id);
        return Err(e);
    }
    Ok(conn_id)
}

fn handle_connection_event(
    conn_id: usize,
    event: &mio::event::Event,
    connections: &mut Slab<MioConnection>,
    revisit: &mut VecDeque<usize>,
    write_budget: usize,
) -> io::Result<()> {
    let Some(conn) = connections.get_mut(conn_id) else {
        return Ok(());
    };

    if event.is_error() {
        return Err(conn
            .stream
            .take_error()?
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "socket error")));
    }

    if (event.is_readable() || event.is_read_closed()) && handle_readable(conn)? {
        // Peer is gone. Responses already produced still go out, but no
        // further steps are taken.
        flush(conn)?;
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "EOF"));
    }

    // Readable or writable, either may have left output to flush or a
    // command to advance.
    service_and_requeue(conn_id, conn, revisit, write_budget)
}

/// Drain the socket into the engine until it would block. Returns true once
/// the peer has closed its side.
fn handle_readable(conn: &mut MioConnection) -> io::Result<bool> {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match conn.stream.read(&mut chunk) {
            Ok(0) => return Ok(true),
            Ok(n) => {
                trace!(peer = %conn.peer, bytes = n, "read");
                conn.conn.on_readable(&chunk[..n], &mut conn.out)?;
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

fn service_and_requeue(
    conn_id: usize,
    conn: &mut MioConnection,
    revisit: &mut VecDeque<usize>,
    write_budget: usize,
) -> io::Result<()> {
    if service(conn, write_budget)? == Service::Yielded && !conn.queued {
        conn.queued = true;
        revisit.push_back(conn_id);
    }
    Ok(())
}

/// Flush pending output, then step the engine while the socket keeps
/// accepting bytes, up to `write_budget` steps.
fn service(conn: &mut MioConnection, write_budget: usize) -> io::Result<Service> {
    let mut steps = 0;
    loop {
        if !flush(conn)? {
            return Ok(Service::Blocked);
        }

        if !conn.conn.is_producing() {
            return Ok(Service::Idle);
        }
        if steps == write_budget {
            return Ok(Service::Yielded);
        }

        conn.conn.on_writable(&mut conn.out)?;
        steps += 1;
    }
}

/// Write pending output until the buffer is empty (true) or the socket
/// would block (false).
fn flush(conn: &mut MioConnection) -> io::Result<bool> {
    while !conn.out.is_empty() {
        match conn.stream.write(&conn.out) {
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
            }
            Ok(n) => conn.out.advance(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

fn close_connection(
    poll: &mut Poll,
    connections: &mut Slab<MioConnection>,
    conn_id: usize,
    reason: &io::Error,
) {
    if let Some(mut conn) = connections.try_remove(conn_id) {
        let _ = poll.registry().deregister(&mut conn.stream);
        trace!(
            conn_id,
            command = ?conn.conn.active_command(),
            buffered = conn.conn.buffered(),
            unsent = conn.out.len(),
            "Releasing connection"
        );

        if reason.kind() == io::ErrorKind::UnexpectedEof {
            conn.conn.on_closed();
        } else {
            conn.conn.on_error(reason);
        }

        debug!(conn_id, peer = %conn.peer, "Connection closed");
    }
}

fn resolve(listen: &str) -> io::Result<SocketAddr> {
    listen.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no address for '{listen}'"),
        )
    })
}

/// Create a TCP listener with SO_REUSEPORT for kernel load balancing.
fn create_listener_with_reuseport(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_port(true)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
