//! Relay module types.

use std::net::SocketAddr;

/// Errors from relay operations.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Failed to bind event relay on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read event relay address: {0}")]
    LocalAddr(#[source] std::io::Error),
}

/// How a relay handles decoded events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// One dispatcher consumes a FIFO queue; hooks never overlap.
    Sequential,
    /// Each event runs on its own task, in no particular order.
    Parallel,
}

impl DispatchMode {
    pub const fn from_parallel(parallel: bool) -> Self {
        if parallel {
            Self::Parallel
        } else {
            Self::Sequential
        }
    }
}
