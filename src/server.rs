//! Tokio server for handling command connections.
//!
//! One task per connection. The task plays reactor adapter for its
//! connection's state machine: reads feed `on_readable`, and while a command
//! is producing, each flushed chunk is followed by another `on_writable`.

use crate::config::Config;
use crate::runtime::{Connection, Limits};
use bytes::BytesMut;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, trace};

/// Read buffer size
const BUFFER_SIZE: usize = 4 * 1024;

/// Server instance
pub struct Server {
    config: Config,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Self {
        let connection_limit = Arc::new(Semaphore::new(config.max_connections));
        Server {
            config,
            connection_limit,
        }
    }

    /// Bind the configured address and serve until Ctrl-C.
    pub async fn run(&self) -> io::Result<()> {
        let listener = TcpListener::bind(&self.config.listen).await?;
        info!(address = %self.config.listen, "Server listening");

        tokio::select! {
            result = self.serve(listener) => result,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received, shutting down");
                Ok(())
            }
        }
    }

    /// Accept connections from `listener` forever.
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        let limits = self.config.limits();
        let write_budget = self.config.write_budget;

        loop {
            // Wait for a connection slot
            let permit = Arc::clone(&self.connection_limit)
                .acquire_owned()
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "New connection");

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, limits, write_budget).await {
                            debug!(peer = %addr, error = %e, "Connection error");
                        }
                        debug!(peer = %addr, "Connection closed");
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }
}

/// Run the tokio-based server.
pub fn run(config: Config) -> io::Result<()> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if config.workers > 0 {
        builder.worker_threads(config.workers);
    }
    let runtime = builder.enable_all().build()?;

    info!(workers = config.workers, "Starting tokio runtime");
    runtime.block_on(Server::new(config).run())
}

/// Handle a single client connection
///
/// Returns once the peer closes its side or the transport fails. The
/// connection's resources are released on every exit path.
pub async fn handle_connection<S>(mut stream: S, limits: Limits, write_budget: usize) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut conn = Connection::new(limits);
    let result = drive(&mut conn, &mut stream, write_budget).await;

    match &result {
        Ok(()) => conn.on_closed(),
        Err(e) => conn.on_error(e),
    }
    result
}

async fn drive<S>(conn: &mut Connection, stream: &mut S, write_budget: usize) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);
    let mut out = BytesMut::new();
    let mut steps = 0;

    loop {
        if !out.is_empty() {
            if !conn.is_producing() {
                writer.write_all(&out).await?;
                out.clear();
                continue;
            }

            // While streaming, keep watching the read side so a peer that
            // goes away stops the command instead of waiting on a write.
            tokio::select! {
                biased;
                read = reader.read_buf(&mut buffer) => {
                    if read? == 0 {
                        trace!(command = ?conn.active_command(), "Connection closed mid-response");
                        return Ok(());
                    }
                    conn.on_readable(&buffer, &mut out)?;
                    buffer.clear();
                }
                written = writer.write_buf(&mut out) => {
                    if written? == 0 {
                        return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                    }
                }
            }
            continue;
        }

        if conn.is_producing() {
            conn.on_writable(&mut out)?;
            steps += 1;
            if steps % write_budget == 0 {
                tokio::task::yield_now().await;
            }
            continue;
        }

        writer.flush().await?;

        buffer.clear();
        let n = reader.read_buf(&mut buffer).await?;
        if n == 0 {
            trace!("Connection closed by client");
            return Ok(());
        }
        conn.on_readable(&buffer, &mut out)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tokio_test::io::Builder;

    fn temp_file(name: &str, contents: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("tokio-{}-{}", std::process::id(), name));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[tokio::test]
    async fn test_sum() {
        let mock = Builder::new().read(b"sum 1 2 3\n").write(b"S 6\n").build();
        handle_connection(mock, Limits::default(), 16).await.unwrap();
    }

    #[tokio::test]
    async fn test_ping_then_cat() {
        let path = temp_file("ping-cat", b"myhost");
        let request = format!("cat {}\n", path.display());

        let mock = Builder::new()
            .read(b"ping\n")
            .write(b"S pong\n")
            .read(request.as_bytes())
            .write(b"S myhost\n")
            .build();
        handle_connection(mock, Limits::default(), 16).await.unwrap();
        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn test_cat_in_single_byte_chunks() {
        let contents: Vec<u8> = (0..300u32).map(|i| (i % 200) as u8).collect();
        let path = temp_file("tiny-chunks", &contents);
        let request = format!("cat {}\n", path.display());

        let mut expected = b"S ".to_vec();
        expected.extend_from_slice(&contents);
        expected.push(b'\n');

        let limits = Limits {
            chunk_size: 1,
            ..Limits::default()
        };
        let mock = Builder::new()
            .read(request.as_bytes())
            .write(&expected)
            .build();
        handle_connection(mock, limits, 3).await.unwrap();
        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn test_invalid_then_valid() {
        let mock = Builder::new()
            .read(b"foo bar\n")
            .write(b"E Invalid command....\n")
            .read(b"cat /no/such/file.txt\n")
            .write(b"E No such file\n")
            .read(b"sum 7\n")
            .write(b"S 7\n")
            .build();
        handle_connection(mock, Limits::default(), 16).await.unwrap();
    }

    #[tokio::test]
    async fn test_split_command_line() {
        let mock = Builder::new()
            .read(b"su")
            .read(b"m 4")
            .read(b"0 2\n")
            .write(b"S 42\n")
            .build();
        handle_connection(mock, Limits::default(), 16).await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_close_stops_cat() {
        let path = temp_file("peer-close", &vec![b'q'; 4096]);
        let request = format!("cat {}\n", path.display());

        let limits = Limits {
            chunk_size: 256,
            ..Limits::default()
        };
        // Nothing past the marker is expected: any further write fails
        // with a broken pipe.
        let mock = Builder::new()
            .read(request.as_bytes())
            .write(b"S ")
            .build();
        handle_connection(mock, limits, 16).await.unwrap();
        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn test_input_while_producing_runs_after() {
        let path = temp_file("queued", b"abc");
        let request = format!("cat {}\n", path.display());

        let limits = Limits {
            chunk_size: 1,
            ..Limits::default()
        };
        let mock = Builder::new()
            .read(request.as_bytes())
            .write(b"S ")
            .read(b"ping\n")
            .write(b"abc\nS pong\n")
            .build();
        handle_connection(mock, limits, 16).await.unwrap();
        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn test_read_error_is_returned() {
        let mock = Builder::new()
            .read(b"sum 1 ")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let err = handle_connection(mock, Limits::default(), 16)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn test_serve_over_tcp() {
        let config = Config {
            listen: "127.0.0.1:0".to_string(),
            workers: 1,
            runtime: crate::config::RuntimeType::Tokio,
            max_connections: 8,
            chunk_size: 256,
            max_line: 1024,
            max_input: 4096,
            write_budget: 16,
            log_level: "info".to_string(),
        };
        let listener = TcpListener::bind(&config.listen).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Server::new(config);
        tokio::spawn(async move { server.serve(listener).await });

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"ping\nsum 5 5\n").await.unwrap();

        let mut response = [0u8; 12];
        stream.read_exact(&mut response).await.unwrap();
        assert_eq!(&response, b"S pong\nS 10\n");
    }
}
