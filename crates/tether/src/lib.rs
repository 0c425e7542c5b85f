//! tether: remote value handles with deferred computation.
//!
//! A client holds [`RemoteHandle`]s to values that live in a server's
//! [`VariableTable`]. Operations on handles return [`Deferred`] values whose
//! shape is known immediately while the server computes in the background.
//! [`lazy`] adds promise-style chaining over any async value.

pub mod artifacts;
pub mod backend;
pub mod bridge;
pub mod client;
pub mod dispatcher;
pub mod handle;
pub mod lazy;
pub mod payload;
pub mod sequencer;
pub mod server;
pub mod table;

/// Crate version from Cargo.toml
pub const TETHER_VERSION: &str = env!("CARGO_PKG_VERSION");

pub use artifacts::{
    ArtifactError, ArtifactStore, HttpArtifactStore, MemoryArtifactStore, ModelArtifacts,
};
pub use backend::{
    BackendError, ComputeBackend, CpuBackend, MetadataBackend, Operand, ShapeBackend,
};
pub use bridge::{ErrorKind, WireError};
pub use client::{Arg, ClientConfig, ClientError, Comm, Deferred, RemoteSession};
pub use dispatcher::{DispatchError, Dispatcher};
pub use handle::{HandleId, Metadata, Payload, RemoteHandle};
pub use lazy::{DynValue, Lazy, LazyError, Object};
pub use payload::{ArrayData, ArrayPayload, ElementType, PayloadError, TensorMeta};
pub use server::{ServerConfig, serve};
pub use table::{EvictionPolicy, IdleTimeout, NeverEvict, VariableTable};
