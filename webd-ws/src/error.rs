//! WebSocket error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http layer: {0}")]
    Http(#[from] webd_http::Error),

    #[error("handshake failed: {0}")]
    Handshake(&'static str),

    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    /// Control frames are limited to 125 payload bytes.
    #[error("control frame too large")]
    ControlTooLarge,

    #[error("frame too large")]
    FrameTooLarge,

    /// The accumulated (or decompressed) message exceeds the frame cap.
    #[error("message too large")]
    MessageTooLarge,

    #[error("unexpected continuation frame")]
    UnexpectedContinuation,

    #[error("expected continuation frame")]
    ExpectedContinuation,

    #[error("decompressed message too large")]
    DecompressionLimit,

    #[error("deflate: {0}")]
    Compression(String),

    /// Clean end of the connection (Close frame or EOF).
    #[error("connection closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for the quiet shutdown paths that should not be logged as
    /// failures.
    pub fn is_clean_close(&self) -> bool {
        match self {
            Error::Closed => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::UnexpectedEof,
            _ => false,
        }
    }
}
