//! TCP listener creation with SO_REUSEPORT.
//!
//! socket2 gives fine-grained control over the socket before it is
//! handed to tokio: SO_REUSEADDR for quick restarts, SO_REUSEPORT so
//! multiple processes can share a port with kernel-level distribution,
//! and optional kernel buffer sizing.

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket as Socket2, Type};
use std::net::{SocketAddr, TcpListener};

/// Listener socket options.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub reuse_port: bool,
    pub backlog: i32,
    pub recv_buffer_size: Option<usize>,
    pub send_buffer_size: Option<usize>,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            reuse_port: true,
            backlog: 1024,
            recv_buffer_size: None,
            send_buffer_size: None,
        }
    }
}

/// Creates, configures, binds, and listens a non-blocking TCP socket
/// ready for `tokio::net::TcpListener::from_std`.
pub fn bind_tcp_listener(bind_addr: SocketAddr, config: &SocketConfig) -> Result<TcpListener> {
    let domain = match bind_addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };

    let socket =
        Socket2::new(domain, Type::STREAM, Some(Protocol::TCP)).context("creating TCP socket")?;

    socket
        .set_reuse_address(true)
        .context("setting SO_REUSEADDR")?;

    if config.reuse_port {
        configure_reuse_port(&socket).context("setting SO_REUSEPORT")?;
    }

    if let Some(size) = config.recv_buffer_size {
        socket
            .set_recv_buffer_size(size)
            .with_context(|| format!("setting SO_RCVBUF to {}", size))?;
    }
    if let Some(size) = config.send_buffer_size {
        socket
            .set_send_buffer_size(size)
            .with_context(|| format!("setting SO_SNDBUF to {}", size))?;
    }

    socket
        .set_nonblocking(true)
        .context("setting O_NONBLOCK")?;

    socket
        .bind(&bind_addr.into())
        .with_context(|| format!("binding TCP socket to {}", bind_addr))?;
    socket
        .listen(config.backlog)
        .context("listening on TCP socket")?;

    Ok(socket.into())
}

/// SO_REUSEPORT where the platform has it; gracefully ignored elsewhere.
#[cfg(any(
    target_os = "android",
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "linux",
    target_os = "macos",
    target_os = "netbsd",
    target_os = "openbsd",
))]
fn configure_reuse_port(socket: &Socket2) -> std::io::Result<()> {
    use std::mem::size_of_val;
    use std::os::fd::AsRawFd;

    let value: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &value as *const _ as *const libc::c_void,
            size_of_val(&value) as libc::socklen_t,
        )
    };

    if ret == -1 {
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ENOPROTOOPT) | Some(libc::EINVAL) => {
                tracing::warn!("SO_REUSEPORT not supported on this platform");
                Ok(())
            }
            _ => Err(err),
        }
    } else {
        Ok(())
    }
}

#[cfg(not(any(
    target_os = "android",
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "linux",
    target_os = "macos",
    target_os = "netbsd",
    target_os = "openbsd",
)))]
fn configure_reuse_port(_socket: &Socket2) -> std::io::Result<()> {
    tracing::warn!("SO_REUSEPORT not available on this platform");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_and_reports_local_addr() {
        let listener =
            bind_tcp_listener("127.0.0.1:0".parse().unwrap(), &SocketConfig::default()).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_eq!(addr.ip().to_string(), "127.0.0.1");
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn two_listeners_share_a_port_with_reuse_port() {
        let config = SocketConfig::default();
        let first = bind_tcp_listener("127.0.0.1:0".parse().unwrap(), &config).unwrap();
        let addr = first.local_addr().unwrap();
        // Second bind to the same port must succeed with SO_REUSEPORT.
        let second = bind_tcp_listener(addr, &config);
        assert!(second.is_ok());
    }
}
