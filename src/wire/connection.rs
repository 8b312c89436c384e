//! TCP connection plumbing: dialing, listening, splitting a stream into
//! independent read and write halves, and writing whole frames.
//!
//! All sockets carry a short read/write timeout so that blocked workers
//! notice cancellation. The timeout ticks surface as `WouldBlock` or
//! `TimedOut` and are retried transparently by [`write_full`] and the
//! reassembler.

use super::WireError;
use crate::config::{Endpoint, SocketOptions};
use crate::coordination::CancelToken;
use anyhow::{Context, Result};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use tracing::debug;

/// Read half of a connection.
#[derive(Debug)]
pub struct ConnReader {
    stream: TcpStream,
}

impl ConnReader {
    /// Tear down the whole connection, including the write half another
    /// thread may still be using. Its next write fails.
    pub fn shutdown(&self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            if e.kind() != ErrorKind::NotConnected {
                debug!("Connection shutdown failed: {}", e);
            }
        }
    }
}

impl Read for ConnReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

/// Write half of a connection.
///
/// Dropping it half-closes the connection (shuts down the write direction) so
/// the peer sees end-of-stream once every frame has been delivered. The read
/// half stays usable.
#[derive(Debug)]
pub struct ConnWriter {
    stream: TcpStream,
}

impl Write for ConnWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Drop for ConnWriter {
    fn drop(&mut self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Write) {
            if e.kind() != ErrorKind::NotConnected {
                debug!("Write shutdown failed: {}", e);
            }
        }
    }
}

/// Split a connected stream into halves that can live on different threads.
pub fn split(stream: TcpStream) -> io::Result<(ConnReader, ConnWriter)> {
    let writer = stream.try_clone()?;
    Ok((ConnReader { stream }, ConnWriter { stream: writer }))
}

/// Write all of `buf`, retrying short writes and timeout ticks.
///
/// A zero-length write is reported as `WriteZero`; a set cancel token turns
/// the next timeout tick into [`WireError::Cancelled`].
pub fn write_full<W: Write + ?Sized>(
    writer: &mut W,
    mut buf: &[u8],
    cancel: &CancelToken,
) -> Result<(), WireError> {
    while !buf.is_empty() {
        match writer.write(buf) {
            Ok(0) => {
                return Err(WireError::Io(io::Error::new(
                    ErrorKind::WriteZero,
                    "connection accepted no more bytes",
                )))
            }
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                if cancel.is_cancelled() {
                    return Err(WireError::Cancelled);
                }
            }
            Err(e) => return Err(WireError::Io(e)),
        }
    }
    Ok(())
}

/// Apply per-connection options to a freshly connected or accepted stream.
pub fn configure_stream(stream: &TcpStream, opts: &SocketOptions) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(opts.nodelay)?;
    stream.set_read_timeout(Some(opts.io_timeout))?;
    stream.set_write_timeout(Some(opts.io_timeout))?;
    Ok(())
}

/// Open a connection to `endpoint`, binding the local side first if the
/// endpoint names one.
pub fn connect(endpoint: &Endpoint, opts: &SocketOptions) -> Result<TcpStream> {
    let socket = Socket::new(
        Domain::for_address(endpoint.remote),
        Type::STREAM,
        Some(Protocol::TCP),
    )
    .context("Failed to create TCP socket")?;

    if let Some(local) = endpoint.local {
        socket
            .set_reuse_address(true)
            .context("Failed to set SO_REUSEADDR")?;
        socket
            .bind(&SockAddr::from(local))
            .with_context(|| format!("Failed to bind local address {}", local))?;
    }

    socket
        .connect(&SockAddr::from(endpoint.remote))
        .with_context(|| format!("Failed to connect to {}", endpoint))?;

    let stream: TcpStream = socket.into();
    configure_stream(&stream, opts)
        .with_context(|| format!("Failed to configure connection to {}", endpoint))?;
    debug!(
        "Connected to {} from {}",
        endpoint.remote,
        stream
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "?".into())
    );
    Ok(stream)
}

/// Bind a listening socket on `addr` with address reuse enabled.
///
/// The listener is non-blocking; the acceptor polls it so it can observe
/// cancellation.
pub fn listen(addr: SocketAddr, backlog: i32) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .context("Failed to create listening socket")?;
    socket
        .set_reuse_address(true)
        .context("Failed to set SO_REUSEADDR")?;
    socket
        .bind(&SockAddr::from(addr))
        .with_context(|| format!("Failed to bind {}", addr))?;
    socket
        .listen(backlog)
        .with_context(|| format!("Failed to listen on {}", addr))?;
    socket
        .set_nonblocking(true)
        .context("Failed to make listener non-blocking")?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Accepts at most `limit` bytes per call, interleaving timeout ticks.
    struct StingyWriter {
        accepted: Vec<u8>,
        limit: usize,
        ticks: usize,
    }

    impl Write for StingyWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.ticks > 0 {
                self.ticks -= 1;
                return Err(io::Error::new(ErrorKind::WouldBlock, "tick"));
            }
            let n = buf.len().min(self.limit);
            self.accepted.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_full_retries_short_writes() {
        let mut writer = StingyWriter {
            accepted: Vec::new(),
            limit: 7,
            ticks: 2,
        };
        let payload: Vec<u8> = (0..100u8).collect();
        write_full(&mut writer, &payload, &CancelToken::new()).unwrap();
        assert_eq!(writer.accepted, payload);
    }

    #[test]
    fn test_write_full_observes_cancel_on_tick() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut writer = StingyWriter {
            accepted: Vec::new(),
            limit: 7,
            ticks: 1,
        };
        assert!(matches!(
            write_full(&mut writer, b"abc", &cancel),
            Err(WireError::Cancelled)
        ));
    }

    #[test]
    fn test_writer_drop_half_closes() {
        let listener = listen("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = listener.local_addr().unwrap();
        let opts = SocketOptions {
            nodelay: true,
            io_timeout: Duration::from_millis(250),
        };
        let endpoint = Endpoint {
            remote: addr,
            local: None,
        };
        let client = connect(&endpoint, &opts).unwrap();

        let server = loop {
            match listener.accept() {
                Ok((stream, _)) => break stream,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(5))
                }
                Err(e) => panic!("accept failed: {}", e),
            }
        };
        configure_stream(&server, &opts).unwrap();

        let (_reader, mut writer) = split(client).unwrap();
        write_full(&mut writer, b"hello", &CancelToken::new()).unwrap();
        drop(writer);

        let mut received = Vec::new();
        let mut server = server;
        server.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"hello");
    }
}
