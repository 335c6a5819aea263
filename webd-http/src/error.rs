//! HTTP-layer error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent bytes that cannot be framed as an HTTP/1.1 request.
    #[error("malformed request: {0}")]
    Malformed(&'static str),

    #[error("request header section too large")]
    HeaderTooLarge,

    #[error("request too large")]
    RequestTooLarge,

    /// Returned by every writer method once the connection has been
    /// hijacked.
    #[error("connection has been hijacked")]
    Hijacked,

    #[error("connection already hijacked")]
    AlreadyHijacked,

    #[error("handler panicked")]
    HandlerPanic,

    #[error("request timed out")]
    Timeout,

    #[error("connection closed")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for errors that mean the peer went away rather than misbehaved.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::ConnectionClosed => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}
