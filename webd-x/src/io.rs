//! Buffered reader/writer bound to a connection.
//!
//! One reader and one writer are bound to each connection on its first
//! readiness event and persist across requests; their backing storage is
//! pooled and reclaimed when the connection's reference count reaches
//! zero. They are shared behind async mutexes, but the per-connection
//! processing flag guarantees at most one worker touches them at a time,
//! so the locks are uncontended in practice.

use crate::conn::Connection;
use bytes::{Buf, BytesMut};
use std::io;
use std::sync::Arc;
use tokio::sync::Mutex;

pub type SharedReader = Arc<Mutex<ConnReader>>;
pub type SharedWriter = Arc<Mutex<ConnWriter>>;

const FILL_CHUNK: usize = 4096;

/// Buffered reader over a [`Connection`].
///
/// The buffer doubles as the engine's peek window: the completeness probe
/// inspects `buffer()` without consuming, and frames/requests are only
/// decoded once the probe says a full message is present.
pub struct ConnReader {
    conn: Arc<Connection>,
    buf: BytesMut,
    eof: bool,
}

impl ConnReader {
    pub fn new(conn: Arc<Connection>, storage: BytesMut) -> Self {
        Self {
            conn,
            buf: storage,
            eof: false,
        }
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buf
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Discards `n` bytes from the front of the buffer.
    pub fn consume(&mut self, n: usize) {
        self.buf.advance(n);
    }

    /// True once the peer has shut down its write side and the socket has
    /// been fully drained into the buffer.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Pulls everything currently pending on the socket into the buffer
    /// without blocking. Returns the number of bytes appended.
    pub fn try_fill(&mut self) -> io::Result<usize> {
        if self.eof {
            return Ok(0);
        }
        let mut total = 0;
        loop {
            self.buf.reserve(FILL_CHUNK);
            match self.conn.try_read_buf(&mut self.buf) {
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Waits for more data, appending at least one byte unless EOF.
    /// Honours the connection's read deadline.
    pub async fn fill(&mut self) -> io::Result<usize> {
        if self.eof {
            return Ok(0);
        }
        self.buf.reserve(FILL_CHUNK);
        let n = self.conn.read_buf(&mut self.buf).await?;
        if n == 0 {
            self.eof = true;
        }
        Ok(n)
    }

    /// Reads into `out`, serving buffered bytes first. Returns 0 at EOF.
    pub async fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.buf.is_empty() {
            if self.eof {
                return Ok(0);
            }
            if self.fill().await? == 0 {
                return Ok(0);
            }
        }
        let n = out.len().min(self.buf.len());
        out[..n].copy_from_slice(&self.buf[..n]);
        self.buf.advance(n);
        Ok(n)
    }

    pub fn conn(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Detaches the backing storage for return to its pool.
    pub fn take_storage(&mut self) -> BytesMut {
        std::mem::take(&mut self.buf)
    }
}

/// Buffered writer over a [`Connection`].
pub struct ConnWriter {
    conn: Arc<Connection>,
    buf: BytesMut,
    capacity: usize,
}

impl ConnWriter {
    pub fn new(conn: Arc<Connection>, storage: BytesMut, capacity: usize) -> Self {
        Self {
            conn,
            buf: storage,
            capacity,
        }
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Buffers `data`, flushing to the socket when the buffer would
    /// overflow. Writes at or above the buffer capacity go straight
    /// through.
    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if self.buf.len() + data.len() > self.capacity {
            self.flush().await?;
        }
        if data.len() >= self.capacity {
            return self.conn.write_all(data).await;
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let pending = self.buf.split();
        self.conn.write_all(&pending).await
    }

    pub fn conn(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn take_storage(&mut self) -> BytesMut {
        std::mem::take(&mut self.buf)
    }
}

/// Combined read/write view handed to installed read handlers after a
/// protocol upgrade. Clones share the same underlying reader and writer.
#[derive(Clone)]
pub struct ConnIo {
    pub conn: Arc<Connection>,
    pub reader: SharedReader,
    pub writer: SharedWriter,
}

impl ConnIo {
    pub fn new(conn: Arc<Connection>, reader: SharedReader, writer: SharedWriter) -> Self {
        Self {
            conn,
            reader,
            writer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn pair() -> (Arc<Connection>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (Arc::new(Connection::new(server).unwrap()), client)
    }

    #[tokio::test]
    async fn try_fill_is_nonblocking_and_buffers_pending_bytes() {
        let (conn, mut client) = pair().await;
        let mut reader = ConnReader::new(conn, BytesMut::with_capacity(64));

        // Nothing pending yet.
        assert_eq!(reader.try_fill().unwrap(), 0);
        assert_eq!(reader.buffered(), 0);

        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        client.flush().await.unwrap();
        // Give the kernel a beat to make the bytes visible.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        reader.try_fill().unwrap();
        assert_eq!(reader.buffer(), b"GET / HTTP/1.1\r\n");
        // Probing did not consume anything.
        assert_eq!(reader.buffered(), 16);
    }

    #[tokio::test]
    async fn consume_advances_past_served_bytes() {
        let (conn, mut client) = pair().await;
        let mut reader = ConnReader::new(conn, BytesMut::with_capacity(64));

        client.write_all(b"abcdef").await.unwrap();
        reader.fill().await.unwrap();
        reader.consume(3);
        assert_eq!(reader.buffer(), b"def");
    }

    #[tokio::test]
    async fn reader_reports_eof_after_peer_shutdown() {
        let (conn, client) = pair().await;
        drop(client);
        let mut reader = ConnReader::new(conn, BytesMut::with_capacity(64));

        let mut out = [0u8; 8];
        assert_eq!(reader.read(&mut out).await.unwrap(), 0);
        assert!(reader.is_eof());
    }

    #[tokio::test]
    async fn writer_buffers_small_writes_until_flush() {
        let (conn, mut client) = pair().await;
        let mut writer = ConnWriter::new(conn, BytesMut::with_capacity(4096), 4096);

        writer.write(b"hello ").await.unwrap();
        writer.write(b"world").await.unwrap();
        assert_eq!(writer.buffered(), 11);
        writer.flush().await.unwrap();
        assert_eq!(writer.buffered(), 0);

        let mut out = vec![0u8; 11];
        client.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"hello world");
    }

    #[tokio::test]
    async fn writer_passes_large_writes_through() {
        let (conn, mut client) = pair().await;
        let mut writer = ConnWriter::new(conn, BytesMut::with_capacity(16), 16);

        let big = vec![0x5A; 1024];
        writer.write(&big).await.unwrap();
        assert_eq!(writer.buffered(), 0, "large write must not be buffered");

        let mut out = vec![0u8; 1024];
        client.read_exact(&mut out).await.unwrap();
        assert_eq!(out, big);
    }
}
