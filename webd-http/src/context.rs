//! Per-request context and the read-handler contract for protocol
//! upgrades.

use crate::response::ResponseWriter;
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use webd_x::io::{SharedReader, SharedWriter};
use webd_x::{Cancellation, ConnIo, Connection};

/// Handler installed on a connection after a protocol upgrade.
///
/// Once installed, the engine invokes it with the combined read/write view
/// on every readiness event instead of running HTTP processing. The
/// handler owns its own framing loop; returning an error closes the
/// connection.
#[async_trait]
pub trait ReadHandler: Send {
    async fn on_readable(&mut self, io: &ConnIo) -> io::Result<()>;
}

pub type BoxReadHandler = Box<dyn ReadHandler>;

/// Engine-provided callback that stores a read handler on the connection
/// state for subsequent events.
pub type ReadHandlerInstaller = Arc<dyn Fn(BoxReadHandler) + Send + Sync>;

/// Bundle created per request iteration inside the state machine: the
/// connection handle, the parent cancellation, the shared buffered
/// reader/writer, and the single-shot read-handler installer.
///
/// Every field is a shared handle, so the bundle itself owns no heap and
/// is rebuilt per iteration; the pools guard the buffers behind the
/// handles instead.
pub struct RequestContext {
    conn: Arc<Connection>,
    cancel: Cancellation,
    reader: SharedReader,
    writer: SharedWriter,
    installer: Option<ReadHandlerInstaller>,
}

impl RequestContext {
    pub fn new(
        conn: Arc<Connection>,
        cancel: Cancellation,
        reader: SharedReader,
        writer: SharedWriter,
    ) -> Self {
        Self {
            conn,
            cancel,
            reader,
            writer,
            installer: None,
        }
    }

    /// Wires the engine callback invoked when a read handler is installed.
    pub fn set_on_set_read_handler(&mut self, installer: ReadHandlerInstaller) {
        self.installer = Some(installer);
    }

    /// Forwards a read handler to the engine for storage on the
    /// connection state.
    pub fn set_read_handler(&self, handler: BoxReadHandler) {
        if let Some(installer) = &self.installer {
            installer(handler);
        }
    }

    pub fn conn(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn cancellation(&self) -> Cancellation {
        self.cancel.clone()
    }

    pub fn reader(&self) -> &SharedReader {
        &self.reader
    }

    pub fn writer(&self) -> &SharedWriter {
        &self.writer
    }

    /// Builds the response writer for this request.
    pub fn response_writer(&self) -> ResponseWriter {
        ResponseWriter::acquire(
            self.conn.clone(),
            self.reader.clone(),
            self.writer.clone(),
            self.installer.clone(),
        )
    }

    /// Ends the iteration. The bundle holds only shared handles, so
    /// releasing is dropping.
    pub fn release(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::Mutex;
    use webd_x::io::{ConnReader, ConnWriter};

    struct NopHandler;

    #[async_trait]
    impl ReadHandler for NopHandler {
        async fn on_readable(&mut self, _io: &ConnIo) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn set_read_handler_forwards_to_installer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let conn = Arc::new(Connection::new(server).unwrap());

        let reader = Arc::new(Mutex::new(ConnReader::new(conn.clone(), BytesMut::new())));
        let writer = Arc::new(Mutex::new(ConnWriter::new(
            conn.clone(),
            BytesMut::new(),
            4096,
        )));

        let installed = Arc::new(AtomicBool::new(false));
        let flag = installed.clone();

        let mut ctx = RequestContext::new(conn, Cancellation::new(), reader, writer);
        ctx.set_on_set_read_handler(Arc::new(move |_h| {
            flag.store(true, Ordering::SeqCst);
        }));
        ctx.set_read_handler(Box::new(NopHandler));

        assert!(installed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn set_read_handler_without_installer_is_a_noop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let conn = Arc::new(Connection::new(server).unwrap());

        let reader = Arc::new(Mutex::new(ConnReader::new(conn.clone(), BytesMut::new())));
        let writer = Arc::new(Mutex::new(ConnWriter::new(
            conn.clone(),
            BytesMut::new(),
            4096,
        )));

        let ctx = RequestContext::new(conn, Cancellation::new(), reader, writer);
        ctx.set_read_handler(Box::new(NopHandler));
        ctx.release();
    }
}
