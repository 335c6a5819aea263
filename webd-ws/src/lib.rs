//! webd-ws: the WebSocket frame engine (RFC 6455, with optional
//! permessage-deflate per RFC 7692).
//!
//! Server side, [`upgrade`] validates the handshake, hijacks the HTTP
//! connection, and installs a [`FrameSession`] as the connection's read
//! handler; the reactor then drives frame processing event by event with
//! zero-allocation header parsing and pooled payload buffers. Client
//! side, [`WsClient::dial`] runs the same session in masked mode.
//!
//! Payloads delivered to [`WsHandler::on_message`] are borrowed views
//! valid only during the callback.

pub mod assembler;
pub mod client;
pub mod deflate;
pub mod error;
pub mod frame;
pub mod handler;
pub mod handshake;
pub mod session;
pub mod writer;

pub use assembler::{Assembler, Message};
pub use client::WsClient;
pub use error::{Error, Result};
pub use frame::{FrameHeader, Opcode};
pub use handler::{WsConn, WsHandler};
pub use handshake::{compute_accept_key, upgrade};
pub use session::FrameSession;
pub use writer::write_message;

use std::sync::Arc;
use webd_http::Request;

pub const DEFAULT_MAX_FRAME_SIZE: u64 = 10 * 1024 * 1024;

/// WebSocket configuration for both upgrades and dials.
#[derive(Clone)]
pub struct WsConfig {
    /// Cap on a single frame and on an assembled (decompressed) message.
    pub max_frame_size: u64,
    /// Offer/accept permessage-deflate. Negotiation always uses
    /// `client_no_context_takeover; server_no_context_takeover`.
    pub enable_compression: bool,
    /// Origin predicate for upgrades; the default allows missing Origin
    /// and same-host origins.
    pub check_origin: Option<Arc<dyn Fn(&Request) -> bool + Send + Sync>>,
    /// Extra request headers for client dials.
    pub headers: Vec<(String, String)>,
    /// Cookies for client dials.
    pub cookies: Vec<(String, String)>,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            enable_compression: false,
            check_origin: None,
            headers: Vec::new(),
            cookies: Vec::new(),
        }
    }
}

impl WsConfig {
    pub fn with_max_frame_size(mut self, max: u64) -> Self {
        self.max_frame_size = max;
        self
    }

    pub fn with_compression(mut self, enable: bool) -> Self {
        self.enable_compression = enable;
        self
    }

    pub fn with_check_origin(
        mut self,
        check: impl Fn(&Request) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.check_origin = Some(Arc::new(check));
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_cookie(mut self, name: &str, value: &str) -> Self {
        self.cookies.push((name.to_string(), value.to_string()));
        self
    }
}

impl std::fmt::Debug for WsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConfig")
            .field("max_frame_size", &self.max_frame_size)
            .field("enable_compression", &self.enable_compression)
            .field("check_origin", &self.check_origin.is_some())
            .field("headers", &self.headers.len())
            .field("cookies", &self.cookies.len())
            .finish()
    }
}
