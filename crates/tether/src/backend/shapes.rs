//! Metadata-only backend for the client side.

use std::sync::atomic::{AtomicUsize, Ordering};

use super::model::{ModelMeta, ModelSpec};
use super::ops::{self, ArgMeta, Op};
use super::{BackendError, MetadataBackend, Operand};
use crate::artifacts::ModelArtifacts;
use crate::bridge::OP_DISPOSE;
use crate::handle::{HandleId, Metadata};
use crate::payload::TensorMeta;

/// Predicts what [`CpuBackend`](super::CpuBackend) will report, without data.
#[derive(Debug, Default)]
pub struct ShapeBackend {
    registered: AtomicUsize,
}

impl ShapeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of handles created through this backend.
    pub fn registered(&self) -> usize {
        self.registered.load(Ordering::Relaxed)
    }
}

static NULL: serde_json::Value = serde_json::Value::Null;

/// Tensor metadata of each operand; literals pass through.
fn tensor_metas(op: &str, args: &[Operand<Metadata>]) -> Result<Vec<Option<TensorMeta>>, BackendError> {
    args.iter()
        .map(|arg| match arg {
            Operand::Value(metadata) => TensorMeta::from_metadata(metadata)
                .map(Some)
                .ok_or_else(|| BackendError::invalid(op, "operand is not a tensor")),
            Operand::Literal(_) => Ok(None),
        })
        .collect()
}

fn arg_metas<'a>(args: &'a [Operand<Metadata>], metas: &'a [Option<TensorMeta>]) -> Vec<ArgMeta<'a>> {
    args.iter()
        .zip(metas)
        .map(|(arg, meta)| match (arg, meta) {
            (_, Some(meta)) => ArgMeta::Tensor(meta),
            (Operand::Literal(v), None) => ArgMeta::Literal(v),
            (Operand::Value(_), None) => ArgMeta::Literal(&NULL),
        })
        .collect()
}

impl MetadataBackend for ShapeBackend {
    fn infer_op(
        &self,
        name: &str,
        args: &[Operand<Metadata>],
    ) -> Result<Option<Metadata>, BackendError> {
        if name == OP_DISPOSE {
            return Ok(None);
        }
        let op = Op::parse(name).ok_or_else(|| BackendError::UnknownOperation(name.to_string()))?;
        let metas = tensor_metas(name, args)?;
        let out = ops::infer(op, &arg_metas(args, &metas))?;
        Ok(Some(out.to_metadata()))
    }

    fn infer_method(
        &self,
        this: &Metadata,
        name: &str,
        args: &[Operand<Metadata>],
    ) -> Result<Option<Metadata>, BackendError> {
        if name == OP_DISPOSE {
            return Ok(None);
        }
        let metas = tensor_metas(name, args)?;

        if let Some(model) = ModelMeta::from_metadata(this) {
            let inputs: Vec<Option<&TensorMeta>> = metas.iter().map(Option::as_ref).collect();
            return model.infer_method(name, &inputs).map(|m| Some(m.to_metadata()));
        }

        let receiver = TensorMeta::from_metadata(this)
            .ok_or_else(|| BackendError::invalid(name, "receiver metadata is not a tensor"))?;
        let op = Op::method(name).ok_or_else(|| BackendError::unknown_method("tensor", name))?;
        let mut full = vec![ArgMeta::Tensor(&receiver)];
        full.extend(arg_metas(args, &metas));
        Ok(Some(ops::infer(op, &full)?.to_metadata()))
    }

    fn infer_model(&self, artifacts: &ModelArtifacts) -> Result<Metadata, BackendError> {
        Ok(ModelSpec::from_topology(&artifacts.topology)?
            .meta()
            .to_metadata())
    }

    fn register(&self, id: &HandleId, metadata: &Metadata) {
        self.registered.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(%id, ?metadata, "Registered local handle");
    }
}
