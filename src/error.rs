//! Error taxonomy for the socket adapter.
//!
//! Usage errors (operating on a closed connection) are returned synchronously
//! to the direct caller. Transport and connect failures observed from inside a
//! reactor continuation never escape; they are routed to the `on_error`
//! callback through the guard, or logged when no handler is set.

use std::io;
use std::net::SocketAddr;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The operation was attempted on a connection that already closed.
    #[error("{op}: socket is closed")]
    Closed { op: &'static str },

    /// A non-blocking connect failed for a reason other than being in
    /// progress. Raised synchronously on the first, caller-driven attempt;
    /// routed through the error callback on reactor-driven retries.
    #[error("error connecting to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Fatal send/recv failure other than would-block.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Failure reported by an application callback.
    #[error("callback error: {0}")]
    App(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wrap an arbitrary application error so a callback can report it
    /// through the guard.
    pub fn app(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Error::App(err.into())
    }
}
