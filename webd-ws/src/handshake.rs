//! Server-side upgrade handshake (RFC 6455 §4).

use crate::error::{Error, Result};
use crate::handler::{WsConn, WsHandler};
use crate::session::FrameSession;
use crate::WsConfig;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha1::{Digest, Sha1};
use std::sync::Arc;
use tracing::debug;
use webd_http::{Method, Request, ResponseWriter};

const WS_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// `Sec-WebSocket-Accept` for a client challenge key.
pub fn compute_accept_key(challenge: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(challenge.as_bytes());
    hasher.update(WS_GUID);
    BASE64.encode(hasher.finalize())
}

/// True when a `Sec-WebSocket-Extensions` value offers permessage-deflate.
pub(crate) fn offers_deflate(extensions: &str) -> bool {
    extensions
        .split(',')
        .any(|ext| match ext.split(';').next() {
            Some(name) => name.trim().eq_ignore_ascii_case("permessage-deflate"),
            None => false,
        })
}

fn default_check_origin(req: &Request) -> bool {
    let origin = match req.header("origin") {
        Some(origin) => origin,
        None => return true,
    };
    let host = origin
        .strip_prefix("https://")
        .or_else(|| origin.strip_prefix("http://"))
        .unwrap_or(origin);
    let host = host.split('/').next().unwrap_or(host);
    match req.header("host") {
        Some(expected) => host.eq_ignore_ascii_case(expected),
        None => false,
    }
}

/// Upgrades an HTTP request to a WebSocket connection.
///
/// Validates the handshake, hijacks the connection, writes the
/// `101 Switching Protocols` response, fires `on_open`, and installs the
/// frame session as the connection's read handler; subsequent readiness
/// events drive the session instead of the HTTP machinery.
pub async fn upgrade(
    req: &Request,
    w: &mut ResponseWriter,
    handler: Arc<dyn WsHandler>,
    mut cfg: WsConfig,
) -> Result<()> {
    if req.method() != Method::Get {
        return Err(Error::Handshake("method not allowed"));
    }
    if !req.headers().has_token("connection", "upgrade") {
        return Err(Error::Handshake("missing Connection: Upgrade"));
    }
    match req.header("upgrade") {
        Some(value) if value.eq_ignore_ascii_case("websocket") => {}
        _ => return Err(Error::Handshake("missing Upgrade: websocket")),
    }
    if req.header("sec-websocket-version") != Some("13") {
        return Err(Error::Handshake("unsupported version (need 13)"));
    }
    let challenge = match req.header("sec-websocket-key") {
        Some(key) if !key.is_empty() => key.to_string(),
        _ => return Err(Error::Handshake("missing Sec-WebSocket-Key")),
    };

    let origin_ok = match &cfg.check_origin {
        Some(check) => check(req),
        None => default_check_origin(req),
    };
    if !origin_ok {
        return Err(Error::Handshake("origin not allowed"));
    }

    let offered = req
        .header("sec-websocket-extensions")
        .is_some_and(offers_deflate);
    cfg.enable_compression = cfg.enable_compression && offered;

    let hijacked = w.hijack().await?;

    let mut response = String::with_capacity(192);
    response.push_str("HTTP/1.1 101 Switching Protocols\r\n");
    response.push_str("Upgrade: websocket\r\n");
    response.push_str("Connection: Upgrade\r\n");
    response.push_str("Sec-WebSocket-Accept: ");
    response.push_str(&compute_accept_key(&challenge));
    response.push_str("\r\n");
    if cfg.enable_compression {
        response.push_str(
            "Sec-WebSocket-Extensions: permessage-deflate; \
             client_no_context_takeover; server_no_context_takeover\r\n",
        );
    }
    response.push_str("\r\n");
    hijacked.write_all(response.as_bytes()).await?;

    debug!(
        peer = %hijacked.peer_addr(),
        compression = cfg.enable_compression,
        "websocket upgrade complete"
    );

    let cfg = Arc::new(cfg);
    let conn = hijacked.conn().clone();
    let ws = WsConn::new(conn.clone(), cfg.clone(), false);
    handler.on_open(&ws).await;

    let session = FrameSession::new(conn, handler, cfg, false);
    w.set_read_handler(Box::new(session));

    Ok(())
}
