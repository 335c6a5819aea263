//! Accept loop and connection drivers.
//!
//! One accept task owns the listener; each accepted connection gets a
//! lightweight driver task that awaits socket readiness and re-enters
//! the engine's state machine — the cooperative-runtime rendition of a
//! reactor delivering readable callbacks onto a worker pool (the tokio
//! workers are the pool).

pub mod socket;

pub use socket::SocketConfig;

use crate::engine::{ConnectionState, Engine};
use crate::telemetry::metrics::{record_metric, MetricsEvent};
use anyhow::Result;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webd_x::Connection;

/// Accept-side options.
#[derive(Debug, Clone, Default)]
pub struct AcceptOptions {
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub keep_alive_timeout: Option<Duration>,
    /// 0 = unlimited. Accepts above the cap are closed immediately.
    pub max_conns: i32,
}

/// Handle for the accept loop. Dropping it does not stop the loop; call
/// [`shutdown`](Self::shutdown) for a graceful stop.
pub struct NetIoHandle {
    local_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    accept_task: JoinHandle<()>,
}

impl NetIoHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting and waits for the accept task. Connections
    /// already being served keep running until they close.
    pub async fn shutdown(self) {
        info!("shutting down listener");
        let _ = self.shutdown_tx.send(());
        let _ = self.accept_task.await;
        info!("listener shutdown complete");
    }
}

/// Spawns the accept loop on `listener`.
pub fn spawn(listener: TcpListener, engine: Arc<Engine>, opts: AcceptOptions) -> Result<NetIoHandle> {
    let local_addr = listener.local_addr()?;
    let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);

    info!(
        addr = %local_addr,
        max_conns = opts.max_conns,
        "listener started"
    );

    let accept_task = tokio::spawn(async move {
        let conns = Arc::new(AtomicI32::new(0));
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            accept_connection(stream, peer, &engine, &opts, &conns);
                        }
                        Err(err) => {
                            warn!(error = %err, "accept failed");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("accept loop stopping");
                    break;
                }
            }
        }
    });

    Ok(NetIoHandle {
        local_addr,
        shutdown_tx,
        accept_task,
    })
}

fn accept_connection(
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    engine: &Arc<Engine>,
    opts: &AcceptOptions,
    conns: &Arc<AtomicI32>,
) {
    // Connection limiter: increment first, back out if over the cap.
    let current = conns.fetch_add(1, Ordering::AcqRel) + 1;
    if opts.max_conns > 0 && current > opts.max_conns {
        conns.fetch_sub(1, Ordering::AcqRel);
        record_metric(MetricsEvent::ConnectionRejected);
        warn!(%peer, current, cap = opts.max_conns, "connection cap reached, rejecting");
        drop(stream);
        return;
    }

    let _ = stream.set_nodelay(true);
    let conn = match Connection::new(stream) {
        Ok(conn) => Arc::new(conn),
        Err(err) => {
            conns.fetch_sub(1, Ordering::AcqRel);
            debug!(%peer, error = %err, "failed to wrap accepted socket");
            return;
        }
    };
    conn.set_read_timeout(opts.read_timeout);
    conn.set_write_timeout(opts.write_timeout);

    let state = ConnectionState::new(conn.cancellation(), opts.read_timeout);
    record_metric(MetricsEvent::ConnectionAccepted);
    debug!(%peer, current, "connection accepted");

    let engine = engine.clone();
    let conns = conns.clone();
    let keep_alive = opts.keep_alive_timeout;
    tokio::spawn(async move {
        drive_connection(&engine, &conn, &state, keep_alive).await;
        // Disconnect: fire the done signal, drop the driver's reference.
        conn.close();
        state.cancel();
        conns.fetch_sub(1, Ordering::AcqRel);
        engine.release_state(&state);
        debug!(peer = %conn.peer_addr(), "connection finished");
    });
}

/// Awaits readiness and re-enters the state machine until the
/// connection dies or idles out.
async fn drive_connection(
    engine: &Engine,
    conn: &Arc<Connection>,
    state: &Arc<ConnectionState>,
    keep_alive: Option<Duration>,
) {
    let cancel = state.cancellation();
    loop {
        let wait_readable = async {
            match keep_alive {
                Some(idle) => match tokio::time::timeout(idle, conn.readable()).await {
                    Ok(result) => result,
                    Err(_) => Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "keep-alive idle timeout",
                    )),
                },
                None => conn.readable().await,
            }
        };

        tokio::select! {
            result = wait_readable => {
                if let Err(err) = result {
                    if err.kind() == io::ErrorKind::TimedOut {
                        debug!(peer = %conn.peer_addr(), "idle timeout");
                    }
                    return;
                }
            }
            _ = cancel.cancelled() => return,
        }

        engine.on_readable(conn, state).await;

        if !conn.is_active() {
            return;
        }
    }
}
