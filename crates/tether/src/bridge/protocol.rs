//! Wire protocol types.
//!
//! One TCP connection per client. The server speaks first with `hello`, then
//! every client frame carries a request id that its `reply` echoes back.
//! Replies may arrive out of order. Failures are additionally broadcast as
//! `error` frames so a client can log them even without a waiter.

use serde::{Deserialize, Serialize};

use crate::handle::{HandleId, RemoteHandle};
use crate::payload::ArrayPayload;

pub const PROTOCOL_VERSION: u32 = 1;

/// Op that fetches model artifacts by url and registers the loaded model.
pub const OP_LOAD_MODEL: &str = "loadModel";
/// Op that exports a registered model to a url.
pub const OP_SAVE_MODEL: &str = "saveModel";
/// Op/method that removes values from the variable table.
pub const OP_DISPOSE: &str = "dispose";

/// Client-assigned request number, unique per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    pub id: RequestId,
    #[serde(flatten)]
    pub request: Request,
}

/// Requests from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Install the handle's inline array under its id.
    Upload { handle: RemoteHandle },

    /// Fetch the value addressed by the handle's id.
    Download { handle: RemoteHandle },

    /// Overwrite the value at the handle's id.
    Update {
        handle: RemoteHandle,
        payload: ArrayPayload,
    },

    /// Run a backend operation. The result is registered under a fresh id.
    Op {
        name: String,
        args: Vec<RemoteHandle>,
    },

    /// Call a method on the value addressed by `this`.
    #[serde(rename = "method")]
    MethodCall {
        this: RemoteHandle,
        name: String,
        args: Vec<RemoteHandle>,
    },
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Upload { .. } => "upload",
            Self::Download { .. } => "download",
            Self::Update { .. } => "update",
            Self::Op { .. } => "op",
            Self::MethodCall { .. } => "method",
        }
    }

    /// Ids whose table entries this request may read or write.
    pub fn touched_ids(&self) -> Vec<HandleId> {
        match self {
            Self::Upload { handle } | Self::Download { handle } | Self::Update { handle, .. } => {
                vec![handle.id.clone()]
            }
            Self::Op { args, .. } => args.iter().map(|h| h.id.clone()).collect(),
            Self::MethodCall { this, args, .. } => std::iter::once(&this.id)
                .chain(args.iter().map(|h| &h.id))
                .cloned()
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    UnknownOperation,
    RemoteExecutionFailure,
    InvalidPayload,
    Unsupported,
    Protocol,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::UnknownOperation => "unknown_operation",
            Self::RemoteExecutionFailure => "remote_execution_failure",
            Self::InvalidPayload => "invalid_payload",
            Self::Unsupported => "unsupported",
            Self::Protocol => "protocol",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error as it travels over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
}

impl WireError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Messages from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First frame on every connection.
    Hello { version: u32, server: String },

    /// Completion of request `id`. Neither field is set for a void result.
    Reply {
        id: RequestId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        handle: Option<RemoteHandle>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<WireError>,
    },

    /// Out-of-band failure notification.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request: Option<RequestId>,
        error: WireError,
    },
}

impl ServerMessage {
    pub fn hello(server: impl Into<String>) -> Self {
        Self::Hello {
            version: PROTOCOL_VERSION,
            server: server.into(),
        }
    }

    pub fn reply(id: RequestId, result: Result<Option<RemoteHandle>, WireError>) -> Self {
        match result {
            Ok(handle) => Self::Reply {
                id,
                handle,
                error: None,
            },
            Err(error) => Self::Reply {
                id,
                handle: None,
                error: Some(error),
            },
        }
    }
}
