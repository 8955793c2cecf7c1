use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Errors surfaced at the public API boundary.
///
/// Transient socket conditions never show up here; they are retried or
/// routed through the connection close path. Loop-affinity violations are
/// panics, not errors.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("event loop is gone")]
    EventLoopGone,

    #[error("pending task queue is full ({0} tasks)")]
    QueueFull(usize),
}

pub type Result<T> = std::result::Result<T, Error>;
