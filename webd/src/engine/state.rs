//! Per-connection state shared between the reactor side and the worker
//! currently inside the state machine.

use bytes::BytesMut;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;
use webd_http::context::BoxReadHandler;
use webd_x::io::{SharedReader, SharedWriter};
use webd_x::Cancellation;

/// One per accepted connection, created on accept and torn down when the
/// reference count hits zero.
///
/// The processing flag is a non-blocking mutex: while it is set, at most
/// one worker executes state-machine code for this connection. The
/// reference count arbitrates teardown between the disconnect path and a
/// worker still mid-flight; pooled buffers are reclaimed only on the
/// 1 → 0 transition.
pub struct ConnectionState {
    processing: AtomicBool,
    refcount: AtomicI32,
    cancel: Cancellation,
    read_timeout: Option<Duration>,
    pub(crate) reader: Mutex<Option<SharedReader>>,
    pub(crate) writer: Mutex<Option<SharedWriter>>,
    read_handler: Mutex<Option<BoxReadHandler>>,
}

impl ConnectionState {
    /// Initial reference count is 1, held by the connection's driver.
    pub fn new(cancel: Cancellation, read_timeout: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            processing: AtomicBool::new(false),
            refcount: AtomicI32::new(1),
            cancel,
            read_timeout,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            read_handler: Mutex::new(None),
        })
    }

    /// The connection's done signal, used as the parent cancellation for
    /// every request served on it.
    pub fn cancellation(&self) -> Cancellation {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// The idle read timeout to restore between keep-alive requests.
    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    /// Test-and-set on the processing flag. `false` means another worker
    /// is mid-flight; the event is not lost because that worker's
    /// double-check (or the reactor's next edge) picks the bytes up.
    pub fn try_begin_processing(&self) -> bool {
        self.processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn end_processing(&self) {
        self.processing.store(false, Ordering::Release);
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    /// Increments the reference count; pairs with [`release`](Self::release).
    pub fn acquire(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrements the reference count; returns `true` exactly once, on
    /// the 1 → 0 transition.
    pub fn release(&self) -> bool {
        let previous = self.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "connection state over-released");
        previous == 1
    }

    pub fn install_read_handler(&self, handler: BoxReadHandler) {
        trace!("custom read handler installed");
        *self.read_handler.lock() = Some(handler);
    }

    pub fn has_read_handler(&self) -> bool {
        self.read_handler.lock().is_some()
    }

    /// Takes the handler out for the duration of a callback; the caller
    /// puts it back unless the connection is going away.
    pub fn take_read_handler(&self) -> Option<BoxReadHandler> {
        self.read_handler.lock().take()
    }

    pub fn put_read_handler(&self, handler: BoxReadHandler) {
        *self.read_handler.lock() = Some(handler);
    }

    /// Detaches the reader's backing storage if nothing else still holds
    /// the shared reader (a hijacker might; then it owns the buffer).
    pub(crate) fn reclaim_reader_storage(&self) -> Option<BytesMut> {
        let shared = self.reader.lock().take()?;
        let mutex = Arc::try_unwrap(shared).ok()?;
        Some(mutex.into_inner().take_storage())
    }

    pub(crate) fn reclaim_writer_storage(&self) -> Option<BytesMut> {
        let shared = self.writer.lock().take()?;
        let mutex = Arc::try_unwrap(shared).ok()?;
        Some(mutex.into_inner().take_storage())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processing_flag_is_exclusive() {
        let state = ConnectionState::new(Cancellation::new(), None);
        assert!(state.try_begin_processing());
        assert!(!state.try_begin_processing());
        state.end_processing();
        assert!(state.try_begin_processing());
    }

    #[test]
    fn refcount_reports_final_release_once() {
        let state = ConnectionState::new(Cancellation::new(), None);
        state.acquire();
        state.acquire();
        assert!(!state.release());
        assert!(!state.release());
        assert!(state.release(), "1 -> 0 must report true");
    }

    #[test]
    fn read_handler_slot_take_put_round_trip() {
        use async_trait::async_trait;
        use webd_http::ReadHandler;
        use webd_x::ConnIo;

        struct Nop;

        #[async_trait]
        impl ReadHandler for Nop {
            async fn on_readable(&mut self, _io: &ConnIo) -> std::io::Result<()> {
                Ok(())
            }
        }

        let state = ConnectionState::new(Cancellation::new(), None);
        assert!(!state.has_read_handler());
        state.install_read_handler(Box::new(Nop));
        assert!(state.has_read_handler());
        let handler = state.take_read_handler().expect("installed");
        assert!(!state.has_read_handler());
        state.put_read_handler(handler);
        assert!(state.has_read_handler());
    }
}
