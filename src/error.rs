use std::io;

use thiserror::Error;

/// Errors surfaced by the public API.
///
/// I/O errors local to a single connection are never returned from a call;
/// they close that connection and are observed through `on_close`. The
/// variants here are the synchronous failures only.
#[derive(Debug, Error)]
pub enum Error {
    /// `send`, `close` or `shutdown_write` was called on a connection that
    /// is no longer connected.
    #[error("connection closed")]
    ConnectionClosed,

    /// The dial deadline elapsed before the peer accepted the connection.
    #[error("i/o timeout")]
    DialTimeout,

    /// The poller was closed twice.
    #[error("poller instance is not running")]
    PollerClosed,

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
