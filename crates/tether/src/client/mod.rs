//! Client side: the connection and the deferred-value proxy built on it.

mod comm;
mod deferred;

use std::time::Duration;

pub use comm::Comm;
pub use deferred::{Arg, Deferred, RemoteSession};

use crate::backend::BackendError;
use crate::bridge::{ErrorKind, WireError};
use crate::payload::PayloadError;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bound on TCP connect plus the server's hello.
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(
                std::env::var("TETHER_CONNECT_TIMEOUT_MS")
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(5000),
            ),
        }
    }
}

impl ClientConfig {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Client errors are cloneable so one failure can reach every waiter on a
/// shared deferred value.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClientError {
    #[error("no server hello within {0:?}")]
    ConnectionTimeout(Duration),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("remote {0}")]
    Remote(WireError),

    #[error("{0}")]
    Unsupported(String),

    #[error("metadata inference failed: {0}")]
    Metadata(#[from] BackendError),

    #[error("'{0}' produced no value")]
    Void(String),

    #[error("invalid payload: {0}")]
    Payload(#[from] PayloadError),

    #[error("model artifacts: {0}")]
    Artifacts(String),

    #[error("background task failed: {0}")]
    Task(String),
}

impl ClientError {
    /// Kind of the server-side failure, if this error came from the server.
    pub fn remote_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Remote(e) => Some(e.kind),
            _ => None,
        }
    }
}
