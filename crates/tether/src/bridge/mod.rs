//! Wire layer between clients and the server.
//!
//! Frames are length-prefixed JSON over any AsyncRead/AsyncWrite.

pub mod codec;
pub mod protocol;

pub use codec::JsonCodec;
pub use protocol::{
    ClientMessage, ErrorKind, OP_DISPOSE, OP_LOAD_MODEL, OP_SAVE_MODEL, PROTOCOL_VERSION, Request,
    RequestId, ServerMessage, WireError,
};
