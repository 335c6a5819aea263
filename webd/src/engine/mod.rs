//! The per-connection state machine.
//!
//! [`Engine::on_readable`] is the reactor callback: it runs once per
//! readiness event, guarded by the connection's processing flag, and
//! drives the request loop — completeness probe, parse, dispatch,
//! response finalization, drain, keep-alive, pipelining — ending with
//! the double-check handoff that closes the race between "no data left"
//! and "data arrived before the flag was released".

pub mod state;

pub use state::ConnectionState;

use crate::telemetry::metrics::{record_metric, MetricsEvent};
use bytes::BytesMut;
use futures::FutureExt;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, trace, warn};
use webd_http::{
    framer, read_request, Handler, Probe, ReadHandlerInstaller, RequestContext,
};
use webd_x::io::{ConnReader, ConnWriter, SharedReader, SharedWriter};
use webd_x::{ConnIo, Connection, Pool};

pub const DEFAULT_MAX_DRAIN_SIZE: u64 = 64 * 1024;
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Read deadline applied while draining an unread keep-alive body.
const DRAIN_DEADLINE: Duration = Duration::from_millis(500);

/// The request-processing engine shared by all connections.
pub struct Engine {
    handler: Arc<dyn Handler>,
    request_timeout: Option<Duration>,
    max_drain_size: u64,
    buffer_size: usize,
    reader_pool: Pool<BytesMut>,
    writer_pool: Pool<BytesMut>,
}

impl Engine {
    pub fn new(handler: Arc<dyn Handler>) -> Self {
        Self {
            handler,
            request_timeout: None,
            max_drain_size: DEFAULT_MAX_DRAIN_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            reader_pool: Pool::new(1024),
            writer_pool: Pool::new(1024),
        }
    }

    /// Per-request deadline surfaced through the request's cancellation.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Cap on unread body bytes discarded to keep a connection alive;
    /// anything larger forces a close.
    pub fn with_max_drain_size(mut self, max: u64) -> Self {
        self.max_drain_size = max;
        self
    }

    /// Buffered reader/writer size.
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Reactor entry point: invoked whenever the connection is readable.
    ///
    /// Every entry takes a reference on the state and every exit —
    /// including panic recovery — gives it back; pool returns happen
    /// only when the count reaches zero.
    pub async fn on_readable(&self, conn: &Arc<Connection>, state: &Arc<ConnectionState>) {
        state.acquire();
        let outcome = AssertUnwindSafe(self.serve_event(conn, state))
            .catch_unwind()
            .await;
        if outcome.is_err() {
            error!(peer = %conn.peer_addr(), "panic escaped the connection state machine");
            conn.close();
            state.end_processing();
        }
        self.release_state(state);
    }

    /// Drops a reference on the state; reclaims the pooled reader/writer
    /// storage on the final release. A hijacker still holding the shared
    /// writer keeps its buffer — it is no longer ours to recycle.
    pub fn release_state(&self, state: &ConnectionState) {
        if state.release() {
            if let Some(storage) = state.reclaim_reader_storage() {
                self.reader_pool.put(storage);
            }
            if let Some(storage) = state.reclaim_writer_storage() {
                self.writer_pool.put(storage);
            }
            record_metric(MetricsEvent::ConnectionClosed);
        }
    }

    async fn serve_event(&self, conn: &Arc<Connection>, state: &Arc<ConnectionState>) {
        // Another worker is mid-flight; its double-check or the next
        // readiness edge covers this event.
        if !state.try_begin_processing() {
            return;
        }

        let (reader, writer) = self.bind_io(conn, state);

        // Protocol handoff: an upgraded connection bypasses HTTP
        // processing entirely.
        if state.has_read_handler() {
            self.run_read_handler(conn, state, &reader, &writer).await;
            state.end_processing();
            return;
        }

        self.serve_http(conn, state, reader, writer).await;
    }

    /// Invokes the installed read handler under panic protection. The
    /// handler owns its own framing loop; any error or panic closes the
    /// connection.
    async fn run_read_handler(
        &self,
        conn: &Arc<Connection>,
        state: &Arc<ConnectionState>,
        reader: &SharedReader,
        writer: &SharedWriter,
    ) {
        let mut handler = match state.take_read_handler() {
            Some(handler) => handler,
            None => return,
        };
        let io = ConnIo::new(conn.clone(), reader.clone(), writer.clone());
        let outcome = AssertUnwindSafe(handler.on_readable(&io)).catch_unwind().await;
        match outcome {
            Err(_) => {
                error!(peer = %conn.peer_addr(), "read handler panicked");
                conn.close();
            }
            Ok(Err(err)) => {
                if err.kind() != io::ErrorKind::UnexpectedEof {
                    debug!(peer = %conn.peer_addr(), error = %err, "read handler failed");
                }
                conn.close();
            }
            Ok(Ok(())) => state.put_read_handler(handler),
        }
    }

    /// Binds pooled reader/writer buffers to the connection on first use;
    /// they persist across requests.
    fn bind_io(
        &self,
        conn: &Arc<Connection>,
        state: &ConnectionState,
    ) -> (SharedReader, SharedWriter) {
        let reader = {
            let mut slot = state.reader.lock();
            match &*slot {
                Some(reader) => reader.clone(),
                None => {
                    let storage = self
                        .reader_pool
                        .get_or(|| BytesMut::with_capacity(self.buffer_size));
                    let reader = Arc::new(tokio::sync::Mutex::new(ConnReader::new(
                        conn.clone(),
                        storage,
                    )));
                    *slot = Some(reader.clone());
                    reader
                }
            }
        };
        let writer = {
            let mut slot = state.writer.lock();
            match &*slot {
                Some(writer) => writer.clone(),
                None => {
                    let storage = self
                        .writer_pool
                        .get_or(|| BytesMut::with_capacity(self.buffer_size));
                    let writer = Arc::new(tokio::sync::Mutex::new(ConnWriter::new(
                        conn.clone(),
                        storage,
                        self.buffer_size,
                    )));
                    *slot = Some(writer.clone());
                    writer
                }
            }
        };
        (reader, writer)
    }

    async fn serve_http(
        &self,
        conn: &Arc<Connection>,
        state: &Arc<ConnectionState>,
        reader: SharedReader,
        writer: SharedWriter,
    ) {
        loop {
            if !conn.is_active() {
                state.end_processing();
                return;
            }

            // Completeness probe: pull whatever the socket has and run
            // the framer over the buffered prefix. Bytes reach the
            // parser only once a full request is present; otherwise the
            // flag is released and the next event re-enters.
            {
                let mut guard = reader.lock().await;
                if let Err(err) = guard.try_fill() {
                    debug!(peer = %conn.peer_addr(), error = %err, "read failed");
                    conn.close();
                    state.end_processing();
                    return;
                }
                if guard.buffered() == 0 {
                    if guard.is_eof() {
                        conn.close();
                    }
                    state.end_processing();
                    return;
                }
                match framer::check(guard.buffer(), framer::DEFAULT_MAX_HEADER_BYTES) {
                    Probe::Incomplete => {
                        if guard.is_eof() {
                            // Peer went away mid-request.
                            conn.close();
                        }
                        state.end_processing();
                        return;
                    }
                    Probe::Malformed(reason) => {
                        warn!(peer = %conn.peer_addr(), reason, "malformed request");
                        conn.close();
                        state.end_processing();
                        return;
                    }
                    Probe::Complete { consumed } => {
                        trace!(peer = %conn.peer_addr(), consumed, "request complete");
                    }
                }
            }

            let mut ctx = RequestContext::new(
                conn.clone(),
                state.cancellation(),
                reader.clone(),
                writer.clone(),
            );
            let installer: ReadHandlerInstaller = {
                let state = state.clone();
                Arc::new(move |handler| state.install_read_handler(handler))
            };
            ctx.set_on_set_read_handler(installer);

            let mut req = match read_request(
                conn,
                &reader,
                state.cancellation(),
                framer::DEFAULT_MAX_HEADER_BYTES,
            )
            .await
            {
                Ok(req) => req,
                Err(err) => {
                    if !err.is_disconnect() {
                        debug!(peer = %conn.peer_addr(), error = %err, "request parse failed");
                    }
                    ctx.release();
                    conn.close();
                    state.end_processing();
                    return;
                }
            };
            if let Some(timeout) = self.request_timeout {
                req.set_timeout(timeout);
            }

            let mut w = ctx.response_writer();

            let dispatch = AssertUnwindSafe(self.handler.serve_http(&mut req, &mut w))
                .catch_unwind()
                .await;

            if dispatch.is_err() {
                record_metric(MetricsEvent::HandlerPanicked);
                error!(peer = %conn.peer_addr(), path = %req.path(), "handler panicked");
                if !w.header_sent() && !w.hijacked() {
                    w.write_header(500);
                    if let Err(err) = w.end().await {
                        debug!(error = %err, "failed to write 500 after panic");
                    }
                }
                drop(w);
                ctx.release();
                conn.close();
                state.end_processing();
                return;
            }

            if let Err(err) = w.end().await {
                debug!(peer = %conn.peer_addr(), error = %err, "response finalization failed");
                drop(w);
                ctx.release();
                conn.close();
                state.end_processing();
                return;
            }

            let hijacked = w.hijacked();
            record_metric(MetricsEvent::RequestServed { status: w.status() });
            drop(w);
            ctx.release();

            if hijacked {
                conn.set_read_timeout(None);
                conn.set_write_timeout(None);

                if state.has_read_handler() {
                    // Event-driven upgrade: subsequent events invoke the
                    // installed handler. Frames that piggybacked on the
                    // handshake bytes are already in our buffer and will
                    // never re-arm the reactor, so dispatch them now.
                    if reader.lock().await.buffered() > 0 {
                        self.run_read_handler(conn, state, &reader, &writer).await;
                    }
                    state.end_processing();
                    return;
                }

                // Synchronous takeover: the hijacker owns this worker.
                // Keep the processing flag and park until disconnect.
                conn.cancelled().await;
                state.end_processing();
                return;
            }

            // Drain any unread body so the next request parses cleanly,
            // up to the cap and under a short deadline.
            if !req.body_mut().is_consumed() {
                conn.set_read_timeout(Some(DRAIN_DEADLINE));
                let drained = req
                    .body_mut()
                    .discard(self.max_drain_size + 1)
                    .await
                    .unwrap_or(0);
                conn.set_read_timeout(None);
                if drained > self.max_drain_size {
                    trace!(peer = %conn.peer_addr(), drained, "drain cap exceeded");
                    req.set_close(true);
                }
            }

            if req.close() {
                conn.close();
                state.end_processing();
                return;
            }

            // Restore the idle timeout for keep-alive.
            conn.set_read_timeout(state.read_timeout());

            // Pipelining: decode the next buffered request without
            // releasing the flag.
            if reader.lock().await.buffered() > 0 {
                continue;
            }

            // Double-check handoff. A readable edge delivered between
            // the check above and this release would otherwise be
            // swallowed by the fast-return in serve_event.
            state.end_processing();
            let has_data = {
                let mut guard = reader.lock().await;
                if guard.buffered() == 0 {
                    let _ = guard.try_fill();
                }
                guard.buffered() > 0
            };
            if has_data {
                if state.try_begin_processing() {
                    continue;
                }
                // Another worker took over; it owns the bytes now.
                return;
            }
            return;
        }
    }
}
