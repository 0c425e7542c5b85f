//! Reference CPU backend.
//!
//! Tensors are dense row-major buffers. Kernels compute in f64 and cast to the
//! dtype [`ops::infer`] picked for the result.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::Value;

use super::model::DenseModel;
use super::ops::{self, ArgMeta, Op};
use super::{BackendError, ComputeBackend, Operand};
use crate::artifacts::ModelArtifacts;
use crate::handle::Metadata;
use crate::payload::{ArrayData, ArrayPayload, TensorMeta};

#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    meta: TensorMeta,
    data: ArrayData,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: ArrayData) -> Result<Self, BackendError> {
        let payload = data.encode(&shape)?;
        Ok(Self {
            meta: payload.meta(),
            data,
        })
    }

    fn from_values(meta: TensorMeta, values: &[f64]) -> Self {
        Self {
            data: ArrayData::from_f64(meta.dtype, values),
            meta,
        }
    }

    pub fn from_payload(payload: &ArrayPayload) -> Result<Self, BackendError> {
        Ok(Self {
            meta: payload.meta(),
            data: payload.decode()?,
        })
    }

    pub fn to_payload(&self) -> Result<ArrayPayload, BackendError> {
        Ok(self.data.encode(&self.meta.shape)?)
    }

    pub fn meta(&self) -> &TensorMeta {
        &self.meta
    }

    pub fn shape(&self) -> &[usize] {
        &self.meta.shape
    }

    pub fn data(&self) -> &ArrayData {
        &self.data
    }

    fn values(&self) -> Vec<f64> {
        self.data.to_f64()
    }
}

#[derive(Debug, Clone)]
pub enum CpuValue {
    Tensor(Tensor),
    Model(DenseModel),
}

impl CpuValue {
    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Self::Tensor(t) => Some(t),
            Self::Model(_) => None,
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            Self::Tensor(_) => "tensor",
            Self::Model(_) => "model",
        }
    }
}

/// In-process backend used by the standalone server and the tests.
#[derive(Debug, Default)]
pub struct CpuBackend {
    released: AtomicUsize,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of values released so far.
    pub fn released(&self) -> usize {
        self.released.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Copy)]
enum Arg<'a> {
    Tensor(&'a Tensor),
    Literal(&'a Value),
}

fn to_args<'a>(op: &str, operands: &'a [Operand<CpuValue>]) -> Result<Vec<Arg<'a>>, BackendError> {
    operands
        .iter()
        .map(|operand| match operand {
            Operand::Value(value) => match value.as_ref() {
                CpuValue::Tensor(t) => Ok(Arg::Tensor(t)),
                CpuValue::Model(_) => Err(BackendError::invalid(op, "a model cannot be an operand")),
            },
            Operand::Literal(v) => Ok(Arg::Literal(v)),
        })
        .collect()
}

impl ComputeBackend for CpuBackend {
    type Value = CpuValue;

    fn call_op(
        &self,
        name: &str,
        args: &[Operand<CpuValue>],
    ) -> Result<Option<CpuValue>, BackendError> {
        let op = Op::parse(name).ok_or_else(|| BackendError::UnknownOperation(name.to_string()))?;
        let args = to_args(name, args)?;
        execute(op, &args).map(|t| Some(CpuValue::Tensor(t)))
    }

    fn call_method(
        &self,
        this: &CpuValue,
        name: &str,
        args: &[Operand<CpuValue>],
    ) -> Result<Option<CpuValue>, BackendError> {
        match this {
            CpuValue::Tensor(receiver) => {
                let op = Op::method(name)
                    .ok_or_else(|| BackendError::unknown_method(this.describe(), name))?;
                let mut full = vec![Arg::Tensor(receiver)];
                full.extend(to_args(name, args)?);
                execute(op, &full).map(|t| Some(CpuValue::Tensor(t)))
            }
            CpuValue::Model(model) => {
                let args = to_args(name, args)?;
                let inputs: Vec<Option<&TensorMeta>> = args
                    .iter()
                    .map(|a| match a {
                        Arg::Tensor(t) => Some(t.meta()),
                        Arg::Literal(_) => None,
                    })
                    .collect();
                let out = model.meta().infer_method(name, &inputs)?;
                let input = tensor_at(&args, 0)?;
                let values = model.predict(&input.values(), out.shape[0]);
                Ok(Some(CpuValue::Tensor(Tensor::from_values(out, &values))))
            }
        }
    }

    fn metadata(&self, value: &CpuValue) -> Metadata {
        match value {
            CpuValue::Tensor(t) => t.meta().to_metadata(),
            CpuValue::Model(m) => m.meta().to_metadata(),
        }
    }

    fn decode(&self, payload: &ArrayPayload) -> Result<CpuValue, BackendError> {
        Tensor::from_payload(payload).map(CpuValue::Tensor)
    }

    fn encode(&self, value: &CpuValue) -> Result<ArrayPayload, BackendError> {
        match value {
            CpuValue::Tensor(t) => t.to_payload(),
            CpuValue::Model(_) => Err(BackendError::Unsupported("downloading a model".into())),
        }
    }

    fn release(&self, value: &CpuValue) {
        self.released.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(kind = value.describe(), "Released value");
    }

    fn load_model(&self, artifacts: ModelArtifacts) -> Result<CpuValue, BackendError> {
        DenseModel::from_artifacts(&artifacts).map(CpuValue::Model)
    }

    fn export_model(&self, value: &CpuValue) -> Result<ModelArtifacts, BackendError> {
        match value {
            CpuValue::Model(m) => Ok(m.to_artifacts()),
            CpuValue::Tensor(_) => Err(BackendError::invalid("saveModel", "value is not a model")),
        }
    }
}

fn execute(op: Op, args: &[Arg<'_>]) -> Result<Tensor, BackendError> {
    let metas: Vec<ArgMeta<'_>> = args
        .iter()
        .map(|a| match a {
            Arg::Tensor(t) => ArgMeta::Tensor(t.meta()),
            Arg::Literal(v) => ArgMeta::Literal(v),
        })
        .collect();
    let out = ops::infer(op, &metas)?;
    let name = op.name();
    let n = out.num_elements();

    let values = match op {
        Op::Zeros => vec![0.0; n],
        Op::Ones => vec![1.0; n],
        Op::Fill => vec![ops::literal_number(name, literal_at(args, 1)?)?; n],
        Op::Scalar => vec![ops::literal_number(name, literal_at(args, 0)?)?],
        Op::Tensor => {
            let mut values = Vec::with_capacity(n);
            ops::flatten_literal(name, literal_at(args, 0)?, &mut values)?;
            values
        }
        Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Maximum => {
            let kernel: fn(f64, f64) -> f64 = match op {
                Op::Add => |a, b| a + b,
                Op::Sub => |a, b| a - b,
                Op::Mul => |a, b| a * b,
                Op::Div => |a, b| a / b,
                _ => f64::max,
            };
            let (a, a_shape) = operand_values(name, &args[0])?;
            let (b, b_shape) = operand_values(name, &args[1])?;
            (0..n)
                .map(|i| {
                    kernel(
                        a[source_offset(i, &out.shape, &a_shape)],
                        b[source_offset(i, &out.shape, &b_shape)],
                    )
                })
                .collect()
        }
        Op::Neg => tensor_at(args, 0)?.values().into_iter().map(|x| -x).collect(),
        Op::Relu => tensor_at(args, 0)?.values().into_iter().map(|x| x.max(0.0)).collect(),
        Op::Exp => tensor_at(args, 0)?.values().into_iter().map(f64::exp).collect(),
        Op::MatMul => {
            let a = tensor_at(args, 0)?;
            let b = tensor_at(args, 1)?;
            mat_mul(&a.values(), &b.values(), a.shape()[0], a.shape()[1], b.shape()[1])
        }
        Op::Sum => {
            let t = tensor_at(args, 0)?;
            let axis_arg = match args.get(1) {
                Some(Arg::Literal(v)) => Some(*v),
                _ => None,
            };
            match ops::resolve_axis(name, axis_arg, t.meta().rank())? {
                Some(axis) => sum_axis(&t.values(), t.shape(), axis),
                None => vec![t.values().iter().sum()],
            }
        }
        Op::Transpose => {
            let t = tensor_at(args, 0)?;
            transpose(&t.values(), t.shape())
        }
        Op::Reshape | Op::Cast | Op::Clone => tensor_at(args, 0)?.values(),
    };

    if values.len() != n {
        return Err(BackendError::Execution(format!(
            "{name} produced {} values for shape {:?}",
            values.len(),
            out.shape
        )));
    }
    Ok(Tensor::from_values(out, &values))
}

fn tensor_at<'a>(args: &[Arg<'a>], i: usize) -> Result<&'a Tensor, BackendError> {
    match args.get(i) {
        Some(Arg::Tensor(t)) => Ok(*t),
        _ => Err(BackendError::Execution(format!("argument {i} is not a tensor"))),
    }
}

fn literal_at<'a>(args: &[Arg<'a>], i: usize) -> Result<&'a Value, BackendError> {
    match args.get(i) {
        Some(Arg::Literal(v)) => Ok(*v),
        _ => Err(BackendError::Execution(format!("argument {i} is not a literal"))),
    }
}

fn operand_values(op: &str, arg: &Arg<'_>) -> Result<(Vec<f64>, Vec<usize>), BackendError> {
    match arg {
        Arg::Tensor(t) => Ok((t.values(), t.shape().to_vec())),
        Arg::Literal(v) => Ok((vec![ops::literal_number(op, v)?], Vec::new())),
    }
}

/// Offset into an operand of `in_shape` for flat output index `flat` under broadcasting.
fn source_offset(mut flat: usize, out_shape: &[usize], in_shape: &[usize]) -> usize {
    let lead = out_shape.len() - in_shape.len();
    let mut offset = 0;
    let mut stride = 1;
    for axis in (0..out_shape.len()).rev() {
        let coord = flat % out_shape[axis];
        flat /= out_shape[axis];
        if axis >= lead {
            let dim = in_shape[axis - lead];
            if dim != 1 {
                offset += coord * stride;
            }
            stride *= dim;
        }
    }
    offset
}

fn mat_mul(a: &[f64], b: &[f64], m: usize, k: usize, n: usize) -> Vec<f64> {
    let mut out = vec![0.0; m * n];
    for i in 0..m {
        for p in 0..k {
            let lhs = a[i * k + p];
            for j in 0..n {
                out[i * n + j] += lhs * b[p * n + j];
            }
        }
    }
    out
}

fn sum_axis(values: &[f64], shape: &[usize], axis: usize) -> Vec<f64> {
    let outer: usize = shape[..axis].iter().product();
    let len = shape[axis];
    let inner: usize = shape[axis + 1..].iter().product();
    let mut out = vec![0.0; outer * inner];
    for o in 0..outer {
        for k in 0..len {
            for i in 0..inner {
                out[o * inner + i] += values[(o * len + k) * inner + i];
            }
        }
    }
    out
}

/// Reverse all axes.
fn transpose(values: &[f64], shape: &[usize]) -> Vec<f64> {
    let rank = shape.len();
    if rank < 2 {
        return values.to_vec();
    }
    let mut strides = vec![1; rank];
    for axis in (0..rank - 1).rev() {
        strides[axis] = strides[axis + 1] * shape[axis + 1];
    }
    let out_shape: Vec<usize> = shape.iter().rev().copied().collect();

    let mut out = Vec::with_capacity(values.len());
    let mut coord = vec![0; rank];
    for _ in 0..values.len() {
        let offset: usize = coord
            .iter()
            .enumerate()
            .map(|(k, c)| c * strides[rank - 1 - k])
            .sum();
        out.push(values[offset]);
        for axis in (0..rank).rev() {
            coord[axis] += 1;
            if coord[axis] < out_shape[axis] {
                break;
            }
            coord[axis] = 0;
        }
    }
    out
}
