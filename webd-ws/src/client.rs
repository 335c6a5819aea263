//! WebSocket client: `ws://` dial with the same frame session the server
//! uses, in masked mode.

use crate::error::{Error, Result};
use crate::handler::{WsConn, WsHandler};
use crate::handshake::offers_deflate;
use crate::session::FrameSession;
use crate::WsConfig;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::BytesMut;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, warn};
use webd_x::io::{ConnIo, ConnReader, ConnWriter};
use webd_x::Connection;

/// Handshake responses larger than this are rejected.
const MAX_HANDSHAKE_RESPONSE: usize = 4096;

const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Tracks connections a client opened, for graceful shutdown.
struct ActiveConns {
    count: Mutex<usize>,
    notify: Notify,
}

impl ActiveConns {
    fn add(&self) {
        *self.count.lock() += 1;
    }

    fn done(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.notify.notify_waiters();
        }
    }

    async fn wait(&self) {
        let mut notified = std::pin::pin!(self.notify.notified());
        loop {
            if *self.count.lock() == 0 {
                return;
            }
            notified.as_mut().enable();
            if *self.count.lock() == 0 {
                return;
            }
            notified.as_mut().await;
            notified.set(self.notify.notified());
        }
    }
}

/// Dials WebSocket servers and tracks the resulting connections.
pub struct WsClient {
    pub dial_timeout: Duration,
    active: Arc<ActiveConns>,
}

impl WsClient {
    pub fn new() -> Self {
        Self {
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            active: Arc::new(ActiveConns {
                count: Mutex::new(0),
                notify: Notify::new(),
            }),
        }
    }

    /// Connects to `url` (`ws://` only), performs the handshake, fires
    /// `on_open`, and leaves a driver task serving incoming frames.
    /// Returns once the handshake has completed.
    pub async fn dial(
        &self,
        url: &str,
        handler: Arc<dyn WsHandler>,
        mut cfg: WsConfig,
    ) -> Result<()> {
        let (connect_addr, authority, path) = parse_ws_url(url)?;

        let stream = tokio::time::timeout(self.dial_timeout, TcpStream::connect(&connect_addr))
            .await
            .map_err(|_| Error::Handshake("dial timeout"))??;
        stream.set_nodelay(true)?;
        let conn = Arc::new(Connection::new(stream)?);

        let key: [u8; 16] = rand::random();
        let sec_key = BASE64.encode(key);
        let request = build_handshake_request(&authority, &path, &sec_key, &cfg);
        conn.write_all(request.as_bytes()).await?;

        // Read and validate the 101 response under the dial timeout.
        let mut reader = ConnReader::new(conn.clone(), BytesMut::with_capacity(1024));
        let head_len = tokio::time::timeout(
            self.dial_timeout,
            read_response_head(&mut reader),
        )
        .await
        .map_err(|_| Error::Handshake("handshake timeout"))??;

        {
            let head = &reader.buffer()[..head_len];
            if !head.starts_with(b"HTTP/1.1 101") {
                conn.close();
                return Err(Error::Handshake("server refused upgrade"));
            }
            cfg.enable_compression =
                cfg.enable_compression && response_negotiated_deflate(head);
        }
        reader.consume(head_len + 4);

        debug!(
            url,
            compression = cfg.enable_compression,
            "websocket dial complete"
        );

        let reader = Arc::new(tokio::sync::Mutex::new(reader));
        let writer = Arc::new(tokio::sync::Mutex::new(ConnWriter::new(
            conn.clone(),
            BytesMut::new(),
            4096,
        )));
        let io = ConnIo::new(conn.clone(), reader, writer);

        self.active.add();
        let wrapped: Arc<dyn WsHandler> = Arc::new(CloseOnce {
            inner: handler,
            active: self.active.clone(),
            fired: AtomicBool::new(false),
        });

        let cfg = Arc::new(cfg);
        let ws = WsConn::new(conn.clone(), cfg.clone(), true);
        wrapped.on_open(&ws).await;

        let mut session = FrameSession::new(conn.clone(), wrapped, cfg, true);
        let cancel = conn.cancellation();
        tokio::spawn(async move {
            // Frames may have piggybacked on the handshake response; if
            // any are buffered the first pass must not wait for a
            // readiness event that will never fire for them.
            let mut skip_wait = io.reader.lock().await.buffered() > 0;
            loop {
                if !skip_wait {
                    tokio::select! {
                        ready = io.conn.readable() => {
                            if ready.is_err() {
                                break;
                            }
                        }
                        _ = cancel.cancelled() => break,
                    }
                }
                skip_wait = false;
                match session.serve(&io).await {
                    Ok(()) => {
                        if !io.conn.is_active() {
                            break;
                        }
                    }
                    Err(err) => {
                        if !err.is_clean_close() {
                            warn!(error = %err, "websocket client session ended");
                        }
                        break;
                    }
                }
            }
            io.conn.close();
            session.emit_close(None).await;
        });

        Ok(())
    }

    /// Waits until every connection opened through this client has
    /// closed.
    pub async fn wait(&self) {
        self.active.wait().await;
    }
}

impl Default for WsClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Fires the wrapped handler's `on_close` exactly once and releases the
/// client's connection count with it.
struct CloseOnce {
    inner: Arc<dyn WsHandler>,
    active: Arc<ActiveConns>,
    fired: AtomicBool,
}

#[async_trait]
impl WsHandler for CloseOnce {
    async fn on_open(&self, conn: &WsConn) {
        self.inner.on_open(conn).await;
    }

    async fn on_message(&self, conn: &WsConn, opcode: crate::Opcode, payload: &[u8]) {
        self.inner.on_message(conn, opcode, payload).await;
    }

    async fn on_ping(&self, conn: &WsConn, payload: &[u8]) {
        self.inner.on_ping(conn, payload).await;
    }

    async fn on_pong(&self, conn: &WsConn, payload: &[u8]) {
        self.inner.on_pong(conn, payload).await;
    }

    async fn on_close(&self, conn: &WsConn, err: Option<&Error>) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            self.inner.on_close(conn, err).await;
            self.active.done();
        }
    }
}

fn parse_ws_url(url: &str) -> Result<(String, String, String)> {
    let rest = url
        .strip_prefix("ws://")
        .ok_or(Error::Handshake("unsupported scheme (only ws://)"))?;
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    if authority.is_empty() {
        return Err(Error::Handshake("missing host"));
    }
    let connect_addr = if authority.contains(':') {
        authority.to_string()
    } else {
        format!("{authority}:80")
    };
    Ok((connect_addr, authority.to_string(), path.to_string()))
}

fn build_handshake_request(authority: &str, path: &str, sec_key: &str, cfg: &WsConfig) -> String {
    let mut out = String::with_capacity(256);
    out.push_str("GET ");
    out.push_str(path);
    out.push_str(" HTTP/1.1\r\nHost: ");
    out.push_str(authority);
    out.push_str("\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n");
    out.push_str("Sec-WebSocket-Key: ");
    out.push_str(sec_key);
    out.push_str("\r\nSec-WebSocket-Version: 13\r\n");
    if cfg.enable_compression {
        out.push_str(
            "Sec-WebSocket-Extensions: permessage-deflate; \
             client_no_context_takeover; server_no_context_takeover\r\n",
        );
    }
    for (name, value) in &cfg.headers {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    if !cfg.cookies.is_empty() {
        out.push_str("Cookie: ");
        for (idx, (name, value)) in cfg.cookies.iter().enumerate() {
            if idx > 0 {
                out.push_str("; ");
            }
            out.push_str(name);
            out.push('=');
            out.push_str(value);
        }
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    out
}

/// Fills the reader until the response head terminator; returns the
/// offset of `\r\n\r\n`.
async fn read_response_head(reader: &mut ConnReader) -> Result<usize> {
    loop {
        if let Some(idx) = find(reader.buffer(), b"\r\n\r\n") {
            return Ok(idx);
        }
        if reader.buffered() > MAX_HANDSHAKE_RESPONSE {
            return Err(Error::Handshake("response header too large"));
        }
        if reader.fill().await? == 0 {
            return Err(Error::Handshake("connection closed during handshake"));
        }
    }
}

fn response_negotiated_deflate(head: &[u8]) -> bool {
    for line in head.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if let Some(colon) = line.iter().position(|&b| b == b':') {
            let (name, value) = line.split_at(colon);
            if name.eq_ignore_ascii_case(b"sec-websocket-extensions") {
                if let Ok(value) = std::str::from_utf8(&value[1..]) {
                    if offers_deflate(value.trim()) {
                        return true;
                    }
                }
            }
        }
    }
    false
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_parsing_defaults_port_and_path() {
        let (addr, authority, path) = parse_ws_url("ws://example.com").unwrap();
        assert_eq!(addr, "example.com:80");
        assert_eq!(authority, "example.com");
        assert_eq!(path, "/");

        let (addr, _, path) = parse_ws_url("ws://example.com:9001/chat?room=1").unwrap();
        assert_eq!(addr, "example.com:9001");
        assert_eq!(path, "/chat?room=1");
    }

    #[test]
    fn non_ws_schemes_are_rejected() {
        assert!(parse_ws_url("wss://example.com").is_err());
        assert!(parse_ws_url("http://example.com").is_err());
    }

    #[test]
    fn handshake_request_carries_headers_and_cookies() {
        let cfg = WsConfig::default()
            .with_header("X-Token", "abc")
            .with_cookie("session", "42")
            .with_cookie("theme", "dark");
        let request = build_handshake_request("h:1", "/ws", "a2V5", &cfg);
        assert!(request.starts_with("GET /ws HTTP/1.1\r\nHost: h:1\r\n"));
        assert!(request.contains("Sec-WebSocket-Key: a2V5\r\n"));
        assert!(request.contains("X-Token: abc\r\n"));
        assert!(request.contains("Cookie: session=42; theme=dark\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn response_extension_scan() {
        let head = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nSec-WebSocket-Extensions: permessage-deflate; client_no_context_takeover\r\n";
        assert!(response_negotiated_deflate(head));
        let head = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n";
        assert!(!response_negotiated_deflate(head));
    }
}
