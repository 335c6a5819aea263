//! TCP connection wrapper.
//!
//! All I/O goes through readiness-driven `try_read`/`try_write` loops so
//! every operation works through a shared reference; the connection is held
//! in an `Arc` by the reactor, the engine, and any hijacker. Deadlines are
//! soft: tokio sockets carry no kernel timeout, so the configured values
//! are applied with `tokio::time::timeout` around each blocking operation.

use crate::cancel::Cancellation;
use bytes::BytesMut;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::trace;

pub struct Connection {
    stream: TcpStream,
    peer_addr: SocketAddr,
    active: AtomicBool,
    read_timeout: Mutex<Option<Duration>>,
    write_timeout: Mutex<Option<Duration>>,
    cancel: Cancellation,
}

impl Connection {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let peer_addr = stream.peer_addr()?;
        Ok(Self {
            stream,
            peer_addr,
            active: AtomicBool::new(true),
            read_timeout: Mutex::new(None),
            write_timeout: Mutex::new(None),
            cancel: Cancellation::new(),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// The connection's done signal; fires on [`close`](Self::close).
    pub fn cancellation(&self) -> Cancellation {
        self.cancel.clone()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Marks the connection closed, fires the done signal, and shuts the
    /// socket down so any task parked on readiness wakes with EOF.
    pub fn close(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            trace!(peer = %self.peer_addr, "closing connection");
            self.cancel.cancel();
            self.shutdown_socket();
        }
    }

    #[cfg(unix)]
    fn shutdown_socket(&self) {
        use std::os::fd::AsRawFd;
        unsafe {
            libc::shutdown(self.stream.as_raw_fd(), libc::SHUT_RDWR);
        }
    }

    #[cfg(not(unix))]
    fn shutdown_socket(&self) {
        // Socket teardown happens when the last Arc drops.
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        *self.read_timeout.lock() = timeout;
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) {
        *self.write_timeout.lock() = timeout;
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        *self.read_timeout.lock()
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        *self.write_timeout.lock()
    }

    /// Waits until the socket reports readable.
    pub async fn readable(&self) -> io::Result<()> {
        self.stream.readable().await
    }

    /// Non-blocking read into the spare capacity of `buf`.
    ///
    /// Returns `Ok(0)` on EOF and `WouldBlock` when the socket has nothing
    /// pending.
    pub fn try_read_buf(&self, buf: &mut BytesMut) -> io::Result<usize> {
        self.stream.try_read_buf(buf)
    }

    /// Reads at least one byte into `buf`, waiting for readiness and
    /// honouring the read deadline.
    pub async fn read_buf(&self, buf: &mut BytesMut) -> io::Result<usize> {
        let op = async {
            loop {
                self.stream.readable().await?;
                match self.stream.try_read_buf(buf) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(e),
                }
            }
        };
        self.with_deadline(self.read_timeout(), op).await
    }

    /// Writes the whole of `data`, honouring the write deadline.
    pub async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        let op = async {
            let mut written = 0;
            while written < data.len() {
                self.stream.writable().await?;
                match self.stream.try_write(&data[written..]) {
                    Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                    Ok(n) => written += n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        };
        self.with_deadline(self.write_timeout(), op).await
    }

    async fn with_deadline<T>(
        &self,
        timeout: Option<Duration>,
        op: impl std::future::Future<Output = io::Result<T>>,
    ) -> io::Result<T> {
        match timeout {
            Some(d) => tokio::time::timeout(d, op)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "i/o deadline exceeded"))?,
            None => op.await,
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer_addr)
            .field("active", &self.is_active())
            .finish()
    }
}
