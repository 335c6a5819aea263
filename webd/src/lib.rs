//! webd: an event-driven HTTP/1.1 and WebSocket server.
//!
//! The value here is the connection-level concurrency engine: tens of
//! thousands of live TCP connections multiplexed across a fixed worker
//! pool, with request processing driven strictly by readiness events —
//! no worker is ever dedicated to an idle connection. The per-connection
//! state machine lives in [`engine`]; the listener and connection
//! drivers in [`netio`]; protocol mechanics come from the `webd-http`
//! and `webd-ws` crates.

pub mod config;
pub mod engine;
pub mod netio;
pub mod runtime;
pub mod server;
pub mod telemetry;

pub use engine::{ConnectionState, Engine};
pub use netio::{AcceptOptions, NetIoHandle, SocketConfig};
pub use server::Server;

// The protocol surface, re-exported for handler authors.
pub use webd_http::{
    Body, Handler, HeaderMap, HijackedConn, Method, Request, ResponseWriter, Version,
};
