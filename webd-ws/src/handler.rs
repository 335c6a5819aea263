//! User-facing WebSocket callbacks and the per-connection write handle.

use crate::error::{Error, Result};
use crate::frame::Opcode;
use crate::writer::write_message;
use crate::WsConfig;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use webd_x::Connection;

/// Write handle for a WebSocket connection, usable from any callback.
#[derive(Clone)]
pub struct WsConn {
    conn: Arc<Connection>,
    cfg: Arc<WsConfig>,
    masked: bool,
}

impl WsConn {
    pub(crate) fn new(conn: Arc<Connection>, cfg: Arc<WsConfig>, masked: bool) -> Self {
        Self { conn, cfg, masked }
    }

    pub async fn send_text(&self, text: &str) -> Result<()> {
        write_message(&self.conn, &self.cfg, Opcode::Text, text.as_bytes(), self.masked).await
    }

    pub async fn send_binary(&self, payload: &[u8]) -> Result<()> {
        write_message(&self.conn, &self.cfg, Opcode::Binary, payload, self.masked).await
    }

    pub async fn send_ping(&self, payload: &[u8]) -> Result<()> {
        write_message(&self.conn, &self.cfg, Opcode::Ping, payload, self.masked).await
    }

    pub async fn send_pong(&self, payload: &[u8]) -> Result<()> {
        write_message(&self.conn, &self.cfg, Opcode::Pong, payload, self.masked).await
    }

    /// Sends an empty Close frame. The peer's Close (or EOF) completes
    /// the shutdown.
    pub async fn send_close(&self) -> Result<()> {
        write_message(&self.conn, &self.cfg, Opcode::Close, &[], self.masked).await
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.conn.peer_addr()
    }

    pub fn is_active(&self) -> bool {
        self.conn.is_active()
    }

    pub fn close(&self) {
        self.conn.close();
    }

    pub(crate) fn conn(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub(crate) fn masked(&self) -> bool {
        self.masked
    }
}

/// Event callbacks for a WebSocket connection.
///
/// `payload` slices are borrowed views into the connection's receive
/// buffer (or a pooled assembly buffer) and are valid **only for the
/// duration of the call**; copy with `to_vec()` before stashing one.
/// The engine answers Pings with Pongs on its own; `on_ping` is purely
/// informational.
#[async_trait]
pub trait WsHandler: Send + Sync {
    async fn on_open(&self, _conn: &WsConn) {}

    async fn on_message(&self, conn: &WsConn, opcode: Opcode, payload: &[u8]);

    async fn on_ping(&self, _conn: &WsConn, _payload: &[u8]) {}

    async fn on_pong(&self, _conn: &WsConn, _payload: &[u8]) {}

    /// Called exactly once when the connection ends; `err` is `None` for
    /// a clean close.
    async fn on_close(&self, _conn: &WsConn, _err: Option<&Error>) {}
}
