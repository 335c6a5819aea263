//! Top-level server: ties the engine to a listener.

use crate::engine::Engine;
use crate::netio::{self, AcceptOptions, NetIoHandle, SocketConfig};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Server {
    engine: Arc<Engine>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    keep_alive_timeout: Option<Duration>,
    max_conns: i32,
    socket: SocketConfig,
}

impl Server {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            read_timeout: Some(DEFAULT_READ_TIMEOUT),
            write_timeout: Some(DEFAULT_WRITE_TIMEOUT),
            keep_alive_timeout: Some(DEFAULT_KEEP_ALIVE_TIMEOUT),
            max_conns: 0,
            socket: SocketConfig::default(),
        }
    }

    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_keep_alive_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.keep_alive_timeout = timeout;
        self
    }

    /// Maximum concurrent connections; 0 means unlimited.
    pub fn with_max_conns(mut self, max: i32) -> Self {
        self.max_conns = max;
        self
    }

    pub fn with_socket_config(mut self, socket: SocketConfig) -> Self {
        self.socket = socket;
        self
    }

    /// Binds `addr` (`host:port`) and starts accepting. Returns the
    /// handle used for graceful shutdown.
    pub async fn start(&self, addr: &str) -> Result<NetIoHandle> {
        let bind_addr = tokio::net::lookup_host(addr)
            .await
            .with_context(|| format!("resolving bind address {addr}"))?
            .next()
            .with_context(|| format!("no address for {addr}"))?;

        let std_listener = netio::socket::bind_tcp_listener(bind_addr, &self.socket)?;
        let listener =
            TcpListener::from_std(std_listener).context("registering listener with runtime")?;

        info!(addr = %bind_addr, max_conns = self.max_conns, "server starting");

        netio::spawn(
            listener,
            self.engine.clone(),
            AcceptOptions {
                read_timeout: self.read_timeout,
                write_timeout: self.write_timeout,
                keep_alive_timeout: self.keep_alive_timeout,
                max_conns: self.max_conns,
            },
        )
    }
}
