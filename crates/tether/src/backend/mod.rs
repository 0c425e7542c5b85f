//! Compute backends.
//!
//! [`ComputeBackend`] executes operations on the server. [`MetadataBackend`]
//! predicts result metadata on the client without touching data, so a
//! deferred value can report its shape before the server has run anything.

pub mod cpu;
pub mod model;
pub mod ops;
pub mod shapes;

use std::sync::Arc;

use crate::artifacts::ModelArtifacts;
use crate::handle::{HandleId, Metadata};
use crate::payload::{ArrayPayload, PayloadError};

pub use cpu::{CpuBackend, CpuValue, Tensor};
pub use model::{DenseModel, ModelMeta};
pub use shapes::ShapeBackend;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("unknown operation '{0}'")]
    UnknownOperation(String),

    #[error("{receiver} has no method '{method}'")]
    UnknownMethod { receiver: String, method: String },

    #[error("invalid arguments for '{op}': {reason}")]
    InvalidArgument { op: String, reason: String },

    #[error("{0}")]
    Execution(String),

    #[error(transparent)]
    Payload(#[from] PayloadError),

    #[error("{0} is not supported by this backend")]
    Unsupported(String),
}

impl BackendError {
    pub fn invalid(op: &str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            op: op.to_string(),
            reason: reason.into(),
        }
    }

    pub fn unknown_method(receiver: impl Into<String>, method: &str) -> Self {
        Self::UnknownMethod {
            receiver: receiver.into(),
            method: method.to_string(),
        }
    }
}

/// Argument to a backend call: a live value or a JSON literal.
#[derive(Debug, Clone)]
pub enum Operand<V> {
    Value(Arc<V>),
    Literal(serde_json::Value),
}

impl<V> Operand<V> {
    pub fn value(&self) -> Option<&V> {
        match self {
            Self::Value(v) => Some(v),
            Self::Literal(_) => None,
        }
    }

    pub fn literal(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Value(_) => None,
            Self::Literal(v) => Some(v),
        }
    }
}

/// Executes operations on live values.
///
/// Calls are synchronous; the dispatcher runs them on the blocking pool.
/// `Ok(None)` is a void result that is never registered.
pub trait ComputeBackend: Send + Sync + 'static {
    type Value: Send + Sync + 'static;

    fn call_op(
        &self,
        name: &str,
        args: &[Operand<Self::Value>],
    ) -> Result<Option<Self::Value>, BackendError>;

    fn call_method(
        &self,
        this: &Self::Value,
        name: &str,
        args: &[Operand<Self::Value>],
    ) -> Result<Option<Self::Value>, BackendError>;

    fn metadata(&self, value: &Self::Value) -> Metadata;

    fn decode(&self, payload: &ArrayPayload) -> Result<Self::Value, BackendError>;

    fn encode(&self, value: &Self::Value) -> Result<ArrayPayload, BackendError>;

    /// Called once for every value leaving the variable table.
    fn release(&self, _value: &Self::Value) {}

    fn load_model(&self, _artifacts: ModelArtifacts) -> Result<Self::Value, BackendError> {
        Err(BackendError::Unsupported("loading models".into()))
    }

    fn export_model(&self, _value: &Self::Value) -> Result<ModelArtifacts, BackendError> {
        Err(BackendError::Unsupported("exporting models".into()))
    }
}

/// Predicts result metadata from argument metadata.
///
/// Must agree with the [`ComputeBackend`] it shadows: for every op,
/// `infer_op` returns what `metadata` reports for the computed result.
pub trait MetadataBackend: Send + Sync + 'static {
    fn infer_op(
        &self,
        name: &str,
        args: &[Operand<Metadata>],
    ) -> Result<Option<Metadata>, BackendError>;

    fn infer_method(
        &self,
        this: &Metadata,
        name: &str,
        args: &[Operand<Metadata>],
    ) -> Result<Option<Metadata>, BackendError>;

    fn infer_model(&self, artifacts: &ModelArtifacts) -> Result<Metadata, BackendError>;

    /// Observes every locally created handle.
    fn register(&self, _id: &HandleId, _metadata: &Metadata) {}
}
