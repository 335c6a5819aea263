//! Buffered HTTP/1.1 response writer.
//!
//! User writes accumulate in a pooled body buffer. Nothing touches the
//! wire until the first flush (explicit, or implicit through `read_from`)
//! or until `end`. A response that is still fully buffered at `end` goes
//! out with a computed `Content-Length`; once headers have been flushed
//! without one, the writer switches to chunked transfer coding and `end`
//! emits the terminating chunk.

use crate::context::{BoxReadHandler, ReadHandlerInstaller};
use crate::error::{Error, Result};
use crate::httpdate::http_date_now;
use crate::request::HeaderMap;
use crate::sniff::detect_content_type;
use bytes::BytesMut;
use once_cell::sync::Lazy;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use webd_x::io::{SharedReader, SharedWriter};
use webd_x::{ConnIo, Connection, Pool, Reuse};

const CRLF: &[u8] = b"\r\n";
const COPY_BUF_SIZE: usize = 32 * 1024;

/// Reusable allocations behind a response writer.
struct RwCore {
    headers: HeaderMap,
    body: BytesMut,
}

impl Reuse for RwCore {
    fn reuse(&mut self) -> bool {
        self.headers.clear();
        self.body.clear();
        true
    }
}

static RW_POOL: Lazy<Pool<RwCore>> = Lazy::new(|| Pool::new(256));
static COPY_POOL: Lazy<Pool<BytesMut>> = Lazy::new(|| Pool::new(64));

/// Per-request response writer. Pooled allocations return on drop.
pub struct ResponseWriter {
    conn: Arc<Connection>,
    reader: SharedReader,
    writer: SharedWriter,
    installer: Option<ReadHandlerInstaller>,
    headers: HeaderMap,
    body: BytesMut,
    status: u16,
    hijacked: bool,
    header_sent: bool,
    chunked: bool,
}

impl ResponseWriter {
    pub fn acquire(
        conn: Arc<Connection>,
        reader: SharedReader,
        writer: SharedWriter,
        installer: Option<ReadHandlerInstaller>,
    ) -> Self {
        let core = RW_POOL.get_or(|| RwCore {
            headers: HeaderMap::new(),
            body: BytesMut::new(),
        });
        Self {
            conn,
            reader,
            writer,
            installer,
            headers: core.headers,
            body: core.body,
            status: 200,
            hijacked: false,
            header_sent: false,
            chunked: false,
        }
    }

    pub fn header_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn set_header(&mut self, name: &str, value: impl AsRef<[u8]>) {
        self.headers.set(name, value);
    }

    /// Records the status code. Ignored once headers are on the wire or
    /// the connection is hijacked.
    pub fn write_header(&mut self, status: u16) {
        if self.hijacked || self.header_sent {
            return;
        }
        self.status = status;
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn hijacked(&self) -> bool {
        self.hijacked
    }

    pub fn header_sent(&self) -> bool {
        self.header_sent
    }

    /// Buffers body bytes. Zero-length writes are dropped so a chunked
    /// stream is never terminated early by an empty chunk.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.hijacked {
            return Err(Error::Hijacked);
        }
        if data.is_empty() {
            return Ok(0);
        }
        self.body.extend_from_slice(data);
        Ok(data.len())
    }

    pub fn write_str(&mut self, text: &str) -> Result<usize> {
        self.write(text.as_bytes())
    }

    /// Sends headers (deciding chunked framing) and any buffered body.
    pub async fn flush(&mut self) -> Result<()> {
        if self.hijacked {
            return Err(Error::Hijacked);
        }
        self.ensure_header_sent().await?;
        if self.body.is_empty() {
            return Ok(());
        }
        let payload = self.body.split();
        if self.chunked {
            self.write_chunk(&payload).await?;
        } else {
            self.conn.write_all(&payload).await?;
        }
        Ok(())
    }

    /// Finalizes the response.
    ///
    /// With headers already flushed this drains the remaining body and,
    /// for chunked responses, emits the `0\r\n\r\n` terminator. Otherwise
    /// the whole response goes out in one write with a computed
    /// `Content-Length` and a sniffed `Content-Type`.
    pub async fn end(&mut self) -> Result<()> {
        if self.hijacked {
            // The hijacker owns the connection; nothing to finalize.
            return Ok(());
        }

        if self.header_sent {
            if !self.body.is_empty() {
                let payload = self.body.split();
                if self.chunked {
                    self.write_chunk(&payload).await?;
                } else {
                    self.conn.write_all(&payload).await?;
                }
            }
            if self.chunked {
                self.conn.write_all(b"0\r\n\r\n").await?;
            }
            return Ok(());
        }

        if !self.headers.contains("content-length") {
            self.headers
                .set("Content-Length", self.body.len().to_string());
        }
        if !self.body.is_empty() && !self.headers.contains("content-type") {
            let content_type = detect_content_type(&self.body);
            self.headers.set("Content-Type", content_type);
        }

        let mut out = BytesMut::with_capacity(256 + self.body.len());
        self.encode_head(&mut out);
        out.extend_from_slice(&self.body);
        self.body.clear();
        self.conn.write_all(&out).await?;
        self.header_sent = true;
        Ok(())
    }

    /// Streams from `src` through a pooled copy buffer, flushing any
    /// buffered response bytes first. Returns the number of bytes copied.
    pub async fn read_from<R>(&mut self, src: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        if self.hijacked {
            return Err(Error::Hijacked);
        }
        self.flush().await?;

        let mut scratch = COPY_POOL.get_or(BytesMut::new);
        scratch.resize(COPY_BUF_SIZE, 0);

        let mut copied: u64 = 0;
        let result = loop {
            let n = match src.read(&mut scratch[..]).await {
                Ok(n) => n,
                Err(e) => break Err(Error::Io(e)),
            };
            if n == 0 {
                break Ok(());
            }
            let write = if self.chunked {
                self.write_chunk(&scratch[..n]).await
            } else {
                self.conn.write_all(&scratch[..n]).await.map_err(Error::Io)
            };
            if let Err(e) = write {
                break Err(e);
            }
            copied += n as u64;
        };

        COPY_POOL.put(scratch);
        result.map(|_| copied)
    }

    /// Takes over the connection.
    ///
    /// Flushes the pooled connection writer and returns a view that
    /// drains any bytes already sitting in the connection's buffered
    /// reader before reading from the socket, so no inbound data is lost
    /// when the caller re-wraps the stream. After this call every other
    /// writer method fails with [`Error::Hijacked`]; the shared writer is
    /// no longer the state machine's to release.
    pub async fn hijack(&mut self) -> Result<HijackedConn> {
        if self.hijacked {
            return Err(Error::AlreadyHijacked);
        }
        self.hijacked = true;
        self.writer.lock().await.flush().await?;
        Ok(HijackedConn {
            conn: self.conn.clone(),
            reader: self.reader.clone(),
            writer: self.writer.clone(),
        })
    }

    /// Installs a custom read handler for subsequent readiness events.
    /// Single-shot: meaningful only together with [`hijack`](Self::hijack).
    pub fn set_read_handler(&self, handler: BoxReadHandler) {
        if let Some(installer) = &self.installer {
            installer(handler);
        }
    }

    pub fn set_read_deadline(&self, timeout: Option<Duration>) {
        self.conn.set_read_timeout(timeout);
    }

    pub fn set_write_deadline(&self, timeout: Option<Duration>) {
        self.conn.set_write_timeout(timeout);
    }

    async fn ensure_header_sent(&mut self) -> Result<()> {
        if self.header_sent {
            return Ok(());
        }
        if !self.headers.contains("content-length") {
            self.chunked = true;
            self.headers.set("Transfer-Encoding", "chunked");
        }
        let mut out = BytesMut::with_capacity(256);
        self.encode_head(&mut out);
        self.conn.write_all(&out).await?;
        self.header_sent = true;
        Ok(())
    }

    fn encode_head(&self, out: &mut BytesMut) {
        out.extend_from_slice(b"HTTP/1.1 ");
        let status = itoa(u64::from(self.status));
        out.extend_from_slice(status.as_bytes());
        out.extend_from_slice(b" ");
        match reason_phrase(self.status) {
            Some(reason) => out.extend_from_slice(reason.as_bytes()),
            None => {
                out.extend_from_slice(b"status code ");
                out.extend_from_slice(status.as_bytes());
            }
        }
        out.extend_from_slice(CRLF);
        if !self.headers.contains("date") {
            out.extend_from_slice(b"Date: ");
            out.extend_from_slice(http_date_now().as_bytes());
            out.extend_from_slice(CRLF);
        }
        self.headers.write_to(out);
        out.extend_from_slice(CRLF);
    }

    async fn write_chunk(&self, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Ok(());
        }
        let mut framed = BytesMut::with_capacity(payload.len() + 16);
        framed.extend_from_slice(format!("{:x}", payload.len()).as_bytes());
        framed.extend_from_slice(CRLF);
        framed.extend_from_slice(payload);
        framed.extend_from_slice(CRLF);
        self.conn.write_all(&framed).await?;
        Ok(())
    }
}

impl Drop for ResponseWriter {
    fn drop(&mut self) {
        RW_POOL.put(RwCore {
            headers: std::mem::take(&mut self.headers),
            body: std::mem::take(&mut self.body),
        });
    }
}

fn itoa(mut value: u64) -> String {
    // Status codes and chunk sizes are small; a plain format keeps this
    // readable.
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::with_capacity(4);
    while value > 0 {
        digits.push(b'0' + (value % 10) as u8);
        value /= 10;
    }
    digits.reverse();
    String::from_utf8(digits).unwrap_or_default()
}

/// Connection view handed to a hijacker. Reads serve the connection's
/// buffered inbound bytes before falling through to the socket.
pub struct HijackedConn {
    conn: Arc<Connection>,
    reader: SharedReader,
    writer: SharedWriter,
}

impl HijackedConn {
    pub async fn read(&self, out: &mut [u8]) -> io::Result<usize> {
        self.reader.lock().await.read(out).await
    }

    pub async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        self.conn.write_all(data).await
    }

    pub fn conn(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn peer_addr(&self) -> std::net::SocketAddr {
        self.conn.peer_addr()
    }

    pub fn close(&self) {
        self.conn.close();
    }

    /// The combined read/write view, for wiring into a read handler.
    pub fn io(&self) -> ConnIo {
        ConnIo::new(self.conn.clone(), self.reader.clone(), self.writer.clone())
    }
}

fn reason_phrase(status: u16) -> Option<&'static str> {
    Some(match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        418 => "I'm a teapot",
        422 => "Unprocessable Entity",
        426 => "Upgrade Required",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => return None,
    })
}
