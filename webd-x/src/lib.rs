//! webd-x: shared substrate for the webd server engine.
//!
//! This crate holds the pieces every other layer builds on:
//!
//! - **Buffer pools** ([`pool`]): a bucketed payload-buffer pool
//!   (512 B / 4 KiB / 16 KiB / 64 KiB, pass-through above) plus a generic
//!   object pool for reusable backing storage.
//! - **Connection wrapper** ([`conn`]): readiness-driven TCP I/O with
//!   soft read/write deadlines and a disconnect signal.
//! - **Buffered I/O** ([`io`]): the persistent per-connection reader and
//!   writer that survive across readiness events, and the combined view
//!   handed to installed read handlers.
//! - **Cancellation** ([`cancel`]): the per-connection done signal used as
//!   the logical context for requests.
//!
//! Nothing in here knows about HTTP or WebSocket framing; those live in
//! `webd-http` and `webd-ws`.

pub mod cancel;
pub mod conn;
pub mod io;
pub mod pool;

pub use cancel::Cancellation;
pub use conn::Connection;
pub use io::{ConnIo, ConnReader, ConnWriter};
pub use pool::{global_pool, BufferPool, Pool, PooledBuf, Reuse};
