//! Operation catalogue and shape inference.
//!
//! Both backends route every op through [`infer`], the CPU backend to size its
//! output and the shape backend as its whole implementation. That keeps the
//! client-side prediction and the server-side result in agreement.
//!
//! Literal numbers are float32 scalars and literal booleans are bool scalars,
//! so `add(int32 tensor, 1)` is float32. Arithmetic on bool is int32,
//! division is always float32.

use serde_json::Value;

use super::BackendError;
use crate::payload::{ElementType, TensorMeta, element_count};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Zeros,
    Ones,
    Fill,
    Scalar,
    Tensor,
    Add,
    Sub,
    Mul,
    Div,
    Maximum,
    Neg,
    Relu,
    Exp,
    MatMul,
    Sum,
    Reshape,
    Transpose,
    Cast,
    Clone,
}

const ALL_OPS: [Op; 19] = [
    Op::Zeros,
    Op::Ones,
    Op::Fill,
    Op::Scalar,
    Op::Tensor,
    Op::Add,
    Op::Sub,
    Op::Mul,
    Op::Div,
    Op::Maximum,
    Op::Neg,
    Op::Relu,
    Op::Exp,
    Op::MatMul,
    Op::Sum,
    Op::Reshape,
    Op::Transpose,
    Op::Cast,
    Op::Clone,
];

impl Op {
    pub fn parse(name: &str) -> Option<Self> {
        ALL_OPS.into_iter().find(|op| op.name() == name)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Zeros => "zeros",
            Self::Ones => "ones",
            Self::Fill => "fill",
            Self::Scalar => "scalar",
            Self::Tensor => "tensor",
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Maximum => "maximum",
            Self::Neg => "neg",
            Self::Relu => "relu",
            Self::Exp => "exp",
            Self::MatMul => "matMul",
            Self::Sum => "sum",
            Self::Reshape => "reshape",
            Self::Transpose => "transpose",
            Self::Cast => "cast",
            Self::Clone => "clone",
        }
    }

    /// Ops that build a tensor from literals only.
    pub fn is_creation(self) -> bool {
        matches!(
            self,
            Self::Zeros | Self::Ones | Self::Fill | Self::Scalar | Self::Tensor
        )
    }

    pub fn is_binary(self) -> bool {
        matches!(
            self,
            Self::Add | Self::Sub | Self::Mul | Self::Div | Self::Maximum
        )
    }

    /// Ops also callable as a method with the tensor as first argument.
    pub fn is_method(self) -> bool {
        !self.is_creation()
    }

    /// Resolve `name` called as a method on a tensor.
    pub fn method(name: &str) -> Option<Self> {
        Self::parse(name).filter(|op| op.is_method())
    }
}

/// Operand as seen by shape inference.
#[derive(Debug, Clone, Copy)]
pub enum ArgMeta<'a> {
    Tensor(&'a TensorMeta),
    Literal(&'a Value),
}

/// Result metadata of `op` applied to `args`.
pub fn infer(op: Op, args: &[ArgMeta<'_>]) -> Result<TensorMeta, BackendError> {
    let name = op.name();
    match op {
        Op::Zeros | Op::Ones => {
            arity(name, args, 1, 2)?;
            let shape = literal_shape(name, literal(name, args, 0)?)?;
            let dtype = optional_dtype(name, args.get(1))?.unwrap_or(ElementType::Float32);
            Ok(TensorMeta::new(dtype, shape))
        }
        Op::Fill => {
            arity(name, args, 2, 3)?;
            let shape = literal_shape(name, literal(name, args, 0)?)?;
            let value = literal(name, args, 1)?;
            literal_number(name, value)?;
            let dtype = match optional_dtype(name, args.get(2))? {
                Some(dtype) => dtype,
                None => literal_dtype(value),
            };
            Ok(TensorMeta::new(dtype, shape))
        }
        Op::Scalar => {
            arity(name, args, 1, 2)?;
            let value = literal(name, args, 0)?;
            literal_number(name, value)?;
            let dtype = match optional_dtype(name, args.get(1))? {
                Some(dtype) => dtype,
                None => literal_dtype(value),
            };
            Ok(TensorMeta::scalar(dtype))
        }
        Op::Tensor => {
            arity(name, args, 1, 3)?;
            let (natural_shape, natural_dtype) = nested_shape(name, literal(name, args, 0)?)?;
            let shape = match args.get(1) {
                None | Some(ArgMeta::Literal(Value::Null)) => natural_shape,
                Some(_) => {
                    let shape = literal_shape(name, literal(name, args, 1)?)?;
                    let have = element_count(&natural_shape).unwrap_or(0);
                    if element_count(&shape) != Some(have) {
                        return Err(BackendError::invalid(
                            name,
                            format!("{have} values do not fill shape {shape:?}"),
                        ));
                    }
                    shape
                }
            };
            let dtype = optional_dtype(name, args.get(2))?.unwrap_or(natural_dtype);
            Ok(TensorMeta::new(dtype, shape))
        }
        Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Maximum => {
            arity(name, args, 2, 2)?;
            let a = operand(name, &args[0])?;
            let b = operand(name, &args[1])?;
            let shape = broadcast(name, &a.shape, &b.shape)?;
            let dtype = if op == Op::Div {
                ElementType::Float32
            } else {
                arithmetic_dtype(a.dtype.max(b.dtype))
            };
            Ok(TensorMeta::new(dtype, shape))
        }
        Op::Neg | Op::Relu => {
            arity(name, args, 1, 1)?;
            let t = tensor(name, args, 0)?;
            Ok(TensorMeta::new(arithmetic_dtype(t.dtype), t.shape.clone()))
        }
        Op::Exp => {
            arity(name, args, 1, 1)?;
            let t = tensor(name, args, 0)?;
            Ok(TensorMeta::new(ElementType::Float32, t.shape.clone()))
        }
        Op::MatMul => {
            arity(name, args, 2, 2)?;
            let a = tensor(name, args, 0)?;
            let b = tensor(name, args, 1)?;
            if a.rank() != 2 || b.rank() != 2 {
                return Err(BackendError::invalid(
                    name,
                    format!("expected rank-2 operands, got {:?} and {:?}", a.shape, b.shape),
                ));
            }
            if a.shape[1] != b.shape[0] {
                return Err(BackendError::invalid(
                    name,
                    format!("inner dimensions differ: {:?} x {:?}", a.shape, b.shape),
                ));
            }
            if a.dtype == ElementType::Bool || b.dtype == ElementType::Bool {
                return Err(BackendError::invalid(name, "bool operands are not supported"));
            }
            Ok(TensorMeta::new(
                a.dtype.max(b.dtype),
                vec![a.shape[0], b.shape[1]],
            ))
        }
        Op::Sum => {
            arity(name, args, 1, 2)?;
            let t = tensor(name, args, 0)?;
            let axis_arg = match args.get(1) {
                Some(ArgMeta::Literal(v)) => Some(*v),
                Some(ArgMeta::Tensor(_)) => {
                    return Err(BackendError::invalid(name, "axis must be a literal"));
                }
                None => None,
            };
            let shape = match resolve_axis(name, axis_arg, t.rank())? {
                Some(axis) => {
                    let mut shape = t.shape.clone();
                    shape.remove(axis);
                    shape
                }
                None => Vec::new(),
            };
            Ok(TensorMeta::new(arithmetic_dtype(t.dtype), shape))
        }
        Op::Reshape => {
            arity(name, args, 2, 2)?;
            let t = tensor(name, args, 0)?;
            let shape = reshape_target(name, literal(name, args, 1)?, t.num_elements())?;
            Ok(TensorMeta::new(t.dtype, shape))
        }
        Op::Transpose => {
            arity(name, args, 1, 1)?;
            let t = tensor(name, args, 0)?;
            Ok(TensorMeta::new(
                t.dtype,
                t.shape.iter().rev().copied().collect(),
            ))
        }
        Op::Cast => {
            arity(name, args, 2, 2)?;
            let t = tensor(name, args, 0)?;
            let dtype = optional_dtype(name, args.get(1))?
                .ok_or_else(|| BackendError::invalid(name, "target dtype is required"))?;
            Ok(TensorMeta::new(dtype, t.shape.clone()))
        }
        Op::Clone => {
            arity(name, args, 1, 1)?;
            Ok(tensor(name, args, 0)?.clone())
        }
    }
}

fn arithmetic_dtype(dtype: ElementType) -> ElementType {
    match dtype {
        ElementType::Bool => ElementType::Int32,
        other => other,
    }
}

fn literal_dtype(value: &Value) -> ElementType {
    match value {
        Value::Bool(_) => ElementType::Bool,
        _ => ElementType::Float32,
    }
}

/// Right-aligned broadcasting: dimensions must match or be 1.
pub fn broadcast(op: &str, a: &[usize], b: &[usize]) -> Result<Vec<usize>, BackendError> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];
    for k in 0..rank {
        let da = if k < a.len() { a[a.len() - 1 - k] } else { 1 };
        let db = if k < b.len() { b[b.len() - 1 - k] } else { 1 };
        out[rank - 1 - k] = if da == db || db == 1 {
            da
        } else if da == 1 {
            db
        } else {
            return Err(BackendError::invalid(
                op,
                format!("shapes {a:?} and {b:?} cannot be broadcast"),
            ));
        };
    }
    Ok(out)
}

/// Normalise an optional axis literal against `rank`. Negative axes count from the end.
pub fn resolve_axis(op: &str, axis: Option<&Value>, rank: usize) -> Result<Option<usize>, BackendError> {
    let Some(axis) = axis else {
        return Ok(None);
    };
    if axis.is_null() {
        return Ok(None);
    }
    let raw = axis
        .as_i64()
        .ok_or_else(|| BackendError::invalid(op, format!("axis {axis} is not an integer")))?;
    let rank_i = rank as i64;
    let normalized = if raw < 0 { raw + rank_i } else { raw };
    if normalized < 0 || normalized >= rank_i {
        return Err(BackendError::invalid(
            op,
            format!("axis {raw} out of range for rank {rank}"),
        ));
    }
    Ok(Some(normalized as usize))
}

/// Shape literal: an array of non-negative integers.
pub fn literal_shape(op: &str, value: &Value) -> Result<Vec<usize>, BackendError> {
    let dims = value
        .as_array()
        .ok_or_else(|| BackendError::invalid(op, format!("shape {value} is not an array")))?;
    let shape = dims
        .iter()
        .map(|d| d.as_u64().and_then(|d| usize::try_from(d).ok()))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| BackendError::invalid(op, format!("shape {value} has a bad dimension")))?;
    if element_count(&shape).is_none() {
        return Err(BackendError::invalid(op, format!("shape {value} is too large")));
    }
    Ok(shape)
}

/// Number or bool literal as f64.
pub fn literal_number(op: &str, value: &Value) -> Result<f64, BackendError> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| BackendError::invalid(op, format!("{n} is not representable"))),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        other => Err(BackendError::invalid(op, format!("{other} is not a number"))),
    }
}

/// Flatten a (possibly nested) array literal in row-major order.
pub fn flatten_literal(op: &str, value: &Value, out: &mut Vec<f64>) -> Result<(), BackendError> {
    match value {
        Value::Array(items) => items.iter().try_for_each(|item| flatten_literal(op, item, out)),
        other => {
            out.push(literal_number(op, other)?);
            Ok(())
        }
    }
}

fn nested_shape(op: &str, value: &Value) -> Result<(Vec<usize>, ElementType), BackendError> {
    match value {
        Value::Array(items) => {
            let Some((first, rest)) = items.split_first() else {
                return Ok((vec![0], ElementType::Float32));
            };
            let (inner, mut dtype) = nested_shape(op, first)?;
            for item in rest {
                let (shape, item_dtype) = nested_shape(op, item)?;
                if shape != inner {
                    return Err(BackendError::invalid(op, "ragged nested array"));
                }
                dtype = dtype.max(item_dtype);
            }
            let mut shape = vec![items.len()];
            shape.extend(inner);
            Ok((shape, dtype))
        }
        other => {
            literal_number(op, other)?;
            Ok((Vec::new(), literal_dtype(other)))
        }
    }
}

fn reshape_target(op: &str, value: &Value, count: usize) -> Result<Vec<usize>, BackendError> {
    let dims = value
        .as_array()
        .ok_or_else(|| BackendError::invalid(op, format!("shape {value} is not an array")))?;
    let mut shape = Vec::with_capacity(dims.len());
    let mut inferred = None;
    for (i, dim) in dims.iter().enumerate() {
        match dim.as_i64() {
            Some(-1) if inferred.is_none() => {
                inferred = Some(i);
                shape.push(1);
            }
            Some(d) if d >= 0 => shape.push(d as usize),
            _ => {
                return Err(BackendError::invalid(op, format!("bad dimension {dim} in {value}")));
            }
        }
    }

    let known = element_count(&shape)
        .ok_or_else(|| BackendError::invalid(op, format!("shape {value} is too large")))?;
    if let Some(i) = inferred {
        if known == 0 || count % known != 0 {
            return Err(BackendError::invalid(
                op,
                format!("cannot infer -1 in {value} for {count} elements"),
            ));
        }
        shape[i] = count / known;
    } else if known != count {
        return Err(BackendError::invalid(
            op,
            format!("{count} elements do not fit shape {value}"),
        ));
    }
    Ok(shape)
}

fn arity(op: &str, args: &[ArgMeta<'_>], min: usize, max: usize) -> Result<(), BackendError> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            min.to_string()
        } else {
            format!("{min}..={max}")
        };
        return Err(BackendError::invalid(
            op,
            format!("expected {expected} arguments, got {}", args.len()),
        ));
    }
    Ok(())
}

fn literal<'a>(op: &str, args: &[ArgMeta<'a>], i: usize) -> Result<&'a Value, BackendError> {
    match args.get(i) {
        Some(ArgMeta::Literal(v)) => Ok(*v),
        Some(ArgMeta::Tensor(_)) => Err(BackendError::invalid(
            op,
            format!("argument {i} must be a literal"),
        )),
        None => Err(BackendError::invalid(op, format!("missing argument {i}"))),
    }
}

fn tensor<'a>(op: &str, args: &[ArgMeta<'a>], i: usize) -> Result<&'a TensorMeta, BackendError> {
    match args.get(i) {
        Some(ArgMeta::Tensor(t)) => Ok(*t),
        Some(ArgMeta::Literal(_)) => Err(BackendError::invalid(
            op,
            format!("argument {i} must be a tensor"),
        )),
        None => Err(BackendError::invalid(op, format!("missing argument {i}"))),
    }
}

/// Binary operand: a tensor, or a number/bool literal as a scalar.
fn operand(op: &str, arg: &ArgMeta<'_>) -> Result<TensorMeta, BackendError> {
    match arg {
        ArgMeta::Tensor(t) => Ok((*t).clone()),
        ArgMeta::Literal(v) => {
            literal_number(op, v)?;
            Ok(TensorMeta::scalar(literal_dtype(v)))
        }
    }
}

fn optional_dtype(op: &str, arg: Option<&ArgMeta<'_>>) -> Result<Option<ElementType>, BackendError> {
    match arg {
        None | Some(ArgMeta::Literal(Value::Null)) => Ok(None),
        Some(ArgMeta::Literal(Value::String(s))) => ElementType::parse(s)
            .map(Some)
            .ok_or_else(|| BackendError::invalid(op, format!("unknown dtype '{s}'"))),
        Some(_) => Err(BackendError::invalid(op, "dtype must be a string literal")),
    }
}
