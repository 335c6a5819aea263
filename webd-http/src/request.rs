//! Request parsing and body reading.
//!
//! The engine only calls [`read_request`] once the framer has reported a
//! complete request in the connection buffer, so parsing normally never
//! waits on the socket; the fill loops below exist for robustness, not the
//! common path.

use crate::error::{Error, Result};
use crate::framer::{find, parse_hex, trim};
use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use webd_x::io::SharedReader;
use webd_x::{Cancellation, Connection};

const CRLF: &[u8] = b"\r\n";
const MAX_HEADER_COUNT: usize = 100;

/// HTTP request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
}

impl Method {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes {
            b"GET" => Some(Method::Get),
            b"HEAD" => Some(Method::Head),
            b"POST" => Some(Method::Post),
            b"PUT" => Some(Method::Put),
            b"DELETE" => Some(Method::Delete),
            b"CONNECT" => Some(Method::Connect),
            b"OPTIONS" => Some(Method::Options),
            b"TRACE" => Some(Method::Trace),
            b"PATCH" => Some(Method::Patch),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Patch => "PATCH",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

/// Ordered, case-insensitive header map.
///
/// Lookup returns the first value for a name; `set` replaces all existing
/// values. Names keep the case they were inserted with.
#[derive(Debug, Default, Clone)]
pub struct HeaderMap {
    entries: Vec<(String, Vec<u8>)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replaces any existing values for `name`.
    pub fn set(&mut self, name: &str, value: impl AsRef<[u8]>) {
        self.remove(name);
        self.entries
            .push((name.to_string(), value.as_ref().to_vec()));
    }

    /// Appends without replacing.
    pub fn add(&mut self, name: &str, value: impl AsRef<[u8]>) {
        self.entries
            .push((name.to_string(), value.as_ref().to_vec()));
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Serializes all entries as `Name: value\r\n` lines.
    pub fn write_to(&self, out: &mut BytesMut) {
        for (name, value) in &self.entries {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(CRLF);
        }
    }

    /// True when a comma-separated header value contains `token`
    /// (case-insensitive).
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        match self.get(name) {
            Some(value) => value
                .split(|&b| b == b',')
                .any(|part| trim(part).eq_ignore_ascii_case(token.as_bytes())),
            None => false,
        }
    }
}

impl webd_x::Reuse for HeaderMap {
    fn reuse(&mut self) -> bool {
        self.entries.clear();
        true
    }
}

/// Per-request cancellation: the connection's done signal combined with an
/// optional deadline. Expiry does not stop the handler, it makes the
/// cancellation observable.
#[derive(Clone)]
pub struct RequestCancel {
    cancel: Cancellation,
    deadline: Option<tokio::time::Instant>,
}

impl RequestCancel {
    pub fn new(cancel: Cancellation) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.deadline = Some(tokio::time::Instant::now() + timeout);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.cancel.is_cancelled() {
            return true;
        }
        match self.deadline {
            Some(deadline) => tokio::time::Instant::now() >= deadline,
            None => false,
        }
    }

    pub async fn cancelled(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.cancel.cancelled().await,
        }
    }
}

enum BodyKind {
    Empty,
    Sized { remaining: u64 },
    Chunked { state: ChunkState },
}

enum ChunkState {
    Size,
    Data { remaining: u64 },
    Done,
}

/// Incremental request body reader over the shared connection buffer.
pub struct Body {
    kind: BodyKind,
    reader: SharedReader,
}

impl Body {
    fn empty(reader: SharedReader) -> Self {
        Self {
            kind: BodyKind::Empty,
            reader,
        }
    }

    /// True when no body was framed or it has been fully consumed.
    pub fn is_consumed(&self) -> bool {
        match &self.kind {
            BodyKind::Empty => true,
            BodyKind::Sized { remaining } => *remaining == 0,
            BodyKind::Chunked { state } => matches!(state, ChunkState::Done),
        }
    }

    /// Reads body bytes into `out`; returns 0 once the body is exhausted.
    pub async fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        match &mut self.kind {
            BodyKind::Empty => Ok(0),
            BodyKind::Sized { remaining } => {
                if *remaining == 0 {
                    return Ok(0);
                }
                let want = out.len().min(usize::try_from(*remaining).unwrap_or(usize::MAX));
                let mut reader = self.reader.lock().await;
                if reader.buffered() == 0 && reader.fill().await? == 0 {
                    return Err(io::ErrorKind::UnexpectedEof.into());
                }
                let n = want.min(reader.buffered());
                out[..n].copy_from_slice(&reader.buffer()[..n]);
                reader.consume(n);
                *remaining -= n as u64;
                Ok(n)
            }
            BodyKind::Chunked { state } => Self::read_chunked(&self.reader, state, out).await,
        }
    }

    async fn read_chunked(
        reader: &SharedReader,
        state: &mut ChunkState,
        out: &mut [u8],
    ) -> io::Result<usize> {
        let mut reader = reader.lock().await;
        loop {
            match state {
                ChunkState::Done => return Ok(0),
                ChunkState::Size => {
                    let line_end = loop {
                        if let Some(idx) = find(reader.buffer(), CRLF) {
                            break idx;
                        }
                        if reader.fill().await? == 0 {
                            return Err(io::ErrorKind::UnexpectedEof.into());
                        }
                    };
                    let size = {
                        let mut line = &reader.buffer()[..line_end];
                        if let Some(semi) = line.iter().position(|&b| b == b';') {
                            line = &line[..semi];
                        }
                        parse_hex(trim(line)).ok_or_else(|| {
                            io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size")
                        })?
                    };
                    reader.consume(line_end + 2);
                    if size == 0 {
                        // Skip through the terminating CRLF; trailer
                        // headers before it are discarded, not parsed.
                        let trailer_end = loop {
                            if let Some(idx) = find(reader.buffer(), CRLF) {
                                break idx;
                            }
                            if reader.fill().await? == 0 {
                                return Err(io::ErrorKind::UnexpectedEof.into());
                            }
                        };
                        reader.consume(trailer_end + 2);
                        *state = ChunkState::Done;
                        return Ok(0);
                    }
                    *state = ChunkState::Data { remaining: size };
                }
                ChunkState::Data { remaining } => {
                    if reader.buffered() == 0 && reader.fill().await? == 0 {
                        return Err(io::ErrorKind::UnexpectedEof.into());
                    }
                    let want = out.len().min(usize::try_from(*remaining).unwrap_or(usize::MAX));
                    let n = want.min(reader.buffered());
                    out[..n].copy_from_slice(&reader.buffer()[..n]);
                    reader.consume(n);
                    *remaining -= n as u64;
                    if *remaining == 0 {
                        // Chunk data is followed by a CRLF.
                        while reader.buffered() < 2 {
                            if reader.fill().await? == 0 {
                                return Err(io::ErrorKind::UnexpectedEof.into());
                            }
                        }
                        reader.consume(2);
                        *state = ChunkState::Size;
                    }
                    if n > 0 {
                        return Ok(n);
                    }
                }
            }
        }
    }

    /// Discards up to `limit` body bytes; returns how many were dropped.
    /// I/O errors (including deadline expiry) end the drain early.
    pub async fn discard(&mut self, limit: u64) -> io::Result<u64> {
        let mut scratch = webd_x::global_pool().acquire(4096);
        let mut dropped: u64 = 0;
        while dropped < limit {
            let want = scratch.len().min(usize::try_from(limit - dropped).unwrap_or(usize::MAX));
            let n = self.read(&mut scratch.as_mut_slice()[..want]).await?;
            if n == 0 {
                break;
            }
            dropped += n as u64;
        }
        Ok(dropped)
    }
}

/// A parsed HTTP request handed to the user handler.
pub struct Request {
    method: Method,
    path: String,
    query: Option<String>,
    version: Version,
    headers: HeaderMap,
    remote_addr: SocketAddr,
    close: bool,
    body: Body,
    cancel: RequestCancel,
}

impl Request {
    pub fn method(&self) -> Method {
        self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get_str(name)
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn body_mut(&mut self) -> &mut Body {
        &mut self.body
    }

    /// Whether the connection must close after this request.
    pub fn close(&self) -> bool {
        self.close
    }

    pub fn set_close(&mut self, close: bool) {
        self.close = close;
    }

    /// Applies the per-request timeout to this request's cancellation.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.cancel.set_timeout(timeout);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the connection disconnects or the request deadline
    /// expires, whichever comes first.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// Keep-alive decision from the Connection header and protocol version:
/// explicit `close` always wins, explicit `keep-alive` always keeps,
/// HTTP/1.1 defaults open and HTTP/1.0 defaults closed.
pub fn should_keep_alive(version: Version, headers: &HeaderMap) -> bool {
    let mut close = false;
    let mut keep_alive = false;
    if let Some(value) = headers.get("connection") {
        for token in value.split(|&b| b == b',') {
            let token = trim(token);
            if token.eq_ignore_ascii_case(b"close") {
                close = true;
            } else if token.eq_ignore_ascii_case(b"keep-alive") {
                keep_alive = true;
            }
        }
    }
    if close {
        false
    } else if keep_alive {
        true
    } else {
        version == Version::Http11
    }
}

/// Parses one request from the shared reader.
///
/// The header section is consumed from the buffer; the body remains for
/// the returned [`Body`] to decode incrementally.
pub async fn read_request(
    conn: &Arc<Connection>,
    reader: &SharedReader,
    cancel: Cancellation,
    max_header_bytes: usize,
) -> Result<Request> {
    let mut guard = reader.lock().await;

    let header_end = loop {
        if let Some(idx) = find(guard.buffer(), b"\r\n\r\n") {
            break idx;
        }
        if guard.buffered() > max_header_bytes {
            return Err(Error::HeaderTooLarge);
        }
        if guard.fill().await? == 0 {
            return Err(Error::ConnectionClosed);
        }
    };

    let (method, path, query, version, headers) = {
        let head = &guard.buffer()[..header_end];

        let line_end = find(head, CRLF).ok_or(Error::Malformed("missing request line"))?;
        let (method, path, query, version) = parse_request_line(&head[..line_end])?;

        let mut headers = HeaderMap::new();
        let mut cur = &head[line_end + 2..];
        while !cur.is_empty() {
            let line;
            match find(cur, CRLF) {
                Some(idx) => {
                    line = &cur[..idx];
                    cur = &cur[idx + 2..];
                }
                None => {
                    line = cur;
                    cur = &[];
                }
            }
            if headers.len() >= MAX_HEADER_COUNT {
                return Err(Error::Malformed("too many headers"));
            }
            let colon = line
                .iter()
                .position(|&b| b == b':')
                .ok_or(Error::Malformed("header line missing colon"))?;
            let name = std::str::from_utf8(trim(&line[..colon]))
                .map_err(|_| Error::Malformed("invalid header name"))?;
            if name.is_empty() {
                return Err(Error::Malformed("empty header name"));
            }
            headers.add(name, trim(&line[colon + 1..]));
        }
        (method, path, query, version, headers)
    };

    guard.consume(header_end + 4);
    drop(guard);

    tracing::trace!(
        method = %method,
        path = %path,
        version = version.as_str(),
        headers = headers.len(),
        "request parsed"
    );

    let body = body_from_headers(&headers, reader.clone());
    let close = !should_keep_alive(version, &headers);

    Ok(Request {
        method,
        path,
        query,
        version,
        headers,
        remote_addr: conn.peer_addr(),
        close,
        body,
        cancel: RequestCancel::new(cancel),
    })
}

fn parse_request_line(line: &[u8]) -> Result<(Method, String, Option<String>, Version)> {
    let mut parts = line.splitn(3, |&b| b == b' ');

    let method_bytes = parts.next().ok_or(Error::Malformed("empty request line"))?;
    let method = Method::from_bytes(method_bytes).ok_or(Error::Malformed("unknown method"))?;

    let target = parts.next().ok_or(Error::Malformed("missing request target"))?;
    let target =
        std::str::from_utf8(target).map_err(|_| Error::Malformed("invalid request target"))?;
    let (path, query) = match target.find('?') {
        Some(idx) => (
            target[..idx].to_string(),
            Some(target[idx + 1..].to_string()),
        ),
        None => (target.to_string(), None),
    };

    let version = match parts.next() {
        Some(b"HTTP/1.1") => Version::Http11,
        Some(b"HTTP/1.0") => Version::Http10,
        Some(_) => return Err(Error::Malformed("unsupported protocol version")),
        None => return Err(Error::Malformed("missing protocol version")),
    };

    Ok((method, path, query, version))
}

fn body_from_headers(headers: &HeaderMap, reader: SharedReader) -> Body {
    if headers.has_token("transfer-encoding", "chunked") {
        return Body {
            kind: BodyKind::Chunked {
                state: ChunkState::Size,
            },
            reader,
        };
    }
    if let Some(value) = headers.get("content-length") {
        if let Ok(text) = std::str::from_utf8(trim(value)) {
            if let Ok(n) = text.parse::<u64>() {
                if n > 0 {
                    return Body {
                        kind: BodyKind::Sized { remaining: n },
                        reader,
                    };
                }
            }
        }
    }
    Body::empty(reader)
}
