//! webd-http: HTTP/1.1 framing, parsing, and response writing.
//!
//! Three of the engine's components live here:
//!
//! - the **request framer** ([`framer`]): a zero-allocation byte-slice
//!   scanner that decides whether a buffered prefix holds a complete
//!   request, used by the engine's completeness probe before any bytes
//!   reach the parser;
//! - the **response writer** ([`response`]): buffered response assembly
//!   with automatic chunked transfer coding, content-type sniffing, a
//!   cached Date header, and connection hijacking;
//! - the **request context** ([`context`]): the per-request bundle wiring
//!   the connection, the shared buffered reader/writer, and the
//!   single-shot read-handler installer used by protocol upgrades.
//!
//! Request parsing ([`request`]) produces the request object handed to
//! user handlers, including incremental Content-Length and chunked body
//! readers.

pub mod context;
pub mod error;
pub mod framer;
pub mod httpdate;
pub mod request;
pub mod response;
pub mod sniff;

pub use context::{BoxReadHandler, ReadHandler, ReadHandlerInstaller, RequestContext};
pub use error::{Error, Result};
pub use framer::{check, Probe, DEFAULT_MAX_HEADER_BYTES};
pub use request::{read_request, should_keep_alive, Body, HeaderMap, Method, Request, Version};
pub use response::{HijackedConn, ResponseWriter};

use async_trait::async_trait;

/// The user-supplied request handler.
///
/// Handlers run on the worker pool under panic protection; a panic before
/// any response byte has been sent produces a `500`, afterwards the
/// connection is closed. Long blocking work starves the pool — that is an
/// operational hazard, not a correctness issue.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn serve_http(&self, req: &mut Request, w: &mut ResponseWriter);
}
